//! Deployment of the action-group Lambda (`kb-action-handler`)
//!
//! The function runs on the OS-only `provided.al2023` runtime: the package is a
//! zip holding one executable named `bootstrap`.

use super::iam::{RoleManager, RoleSpec};
use super::policy;
use crate::aws::arn;
use crate::config::LambdaSettings;
use crate::error::KitError;
use crate::poll::{poll_until, Poll};
use crate::Result;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{Architecture, Environment, FunctionCode, Runtime};
use aws_sdk_lambda::Client;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const BOOTSTRAP_NAME: &str = "bootstrap";
pub const PERMISSION_STATEMENT_ID: &str = "BedrockAgentInvoke";
pub const BEDROCK_PRINCIPAL: &str = "bedrock.amazonaws.com";

/// Environment variables read by the handler
pub mod env_keys {
    pub const KNOWLEDGE_BASE_ID: &str = "KNOWLEDGE_BASE_ID";
    pub const MODEL_ID: &str = "MODEL_ID";
    pub const MODEL_ACCOUNT_ID: &str = "MODEL_ACCOUNT_ID";
    pub const S3_BUCKET: &str = "S3_BUCKET";
    pub const REGION: &str = "AWSREGION";
}

/// Zip `bytes` as an executable `bootstrap` entry
pub fn package_bootstrap_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o755);

    writer.start_file(BOOTSTRAP_NAME, options)?;
    writer.write_all(bytes)?;
    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

/// Read the prebuilt handler executable and zip it
pub fn package_bootstrap(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|e| {
        KitError::packaging_error(format!(
            "Cannot read handler executable {}: {} (build it with `cargo build --release --bin kb-action-handler` for the Lambda target)",
            path.display(),
            e
        ))
    })?;
    let package = package_bootstrap_bytes(&bytes)?;
    debug!(path = %path.display(), size = package.len(), "Packaged handler");
    Ok(package)
}

pub struct LambdaDeployer<'a> {
    client: Client,
    roles: &'a RoleManager,
    settings: &'a LambdaSettings,
    region: String,
    account_id: String,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl<'a> LambdaDeployer<'a> {
    pub fn new(
        client: Client,
        roles: &'a RoleManager,
        settings: &'a LambdaSettings,
        region: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            roles,
            settings,
            region: region.into(),
            account_id: account_id.into(),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    fn role_spec(&self) -> RoleSpec {
        RoleSpec {
            name: self.settings.role_name.clone(),
            description: Some("Execution role for the Bedrock agent action-group handler".to_string()),
            trust_policy: policy::service_trust_policy("lambda.amazonaws.com"),
            managed_policy_arns: policy::LAMBDA_MANAGED_POLICIES
                .iter()
                .map(|arn| arn.to_string())
                .collect(),
            inline_policy: Some((
                "BedrockAgentAccess".to_string(),
                policy::lambda_access_policy(),
            )),
        }
    }

    /// ARN of the deployed function, if any
    pub async fn find_function(&self) -> Result<Option<String>> {
        match self
            .client
            .get_function()
            .function_name(&self.settings.function_name)
            .send()
            .await
        {
            Ok(output) => Ok(output
                .configuration()
                .and_then(|c| c.function_arn())
                .map(str::to_string)),
            Err(err) => {
                let err = KitError::from(err);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Create or update the handler and allow Bedrock agents to invoke it
    pub async fn deploy_function(&self, environment: HashMap<String, String>) -> Result<String> {
        let role_arn = self.roles.ensure_role(&self.role_spec()).await?;
        let package = package_bootstrap(&self.settings.bootstrap_path)?;
        let name = &self.settings.function_name;

        let function_arn = match self.find_function().await? {
            Some(existing_arn) => {
                info!(function = %name, "Function already exists, updating code");
                self.client
                    .update_function_code()
                    .function_name(name)
                    .zip_file(Blob::new(package))
                    .publish(true)
                    .send()
                    .await?;
                existing_arn
            }
            None => {
                info!(function = %name, runtime = %self.settings.runtime, "Creating function");
                let output = self
                    .client
                    .create_function()
                    .function_name(name)
                    .runtime(Runtime::from(self.settings.runtime.as_str()))
                    .architectures(Architecture::from(self.settings.architecture.as_str()))
                    .role(role_arn)
                    .handler(BOOTSTRAP_NAME)
                    .code(FunctionCode::builder().zip_file(Blob::new(package)).build())
                    .environment(
                        Environment::builder()
                            .set_variables(Some(environment))
                            .build(),
                    )
                    .timeout(self.settings.timeout_seconds)
                    .memory_size(self.settings.memory_mb)
                    .publish(true)
                    .send()
                    .await?;
                output
                    .function_arn()
                    .map(str::to_string)
                    .unwrap_or_else(|| arn::lambda_function(&self.region, &self.account_id, name))
            }
        };

        self.wait_until_active().await?;
        self.add_resource_policy().await?;
        Ok(function_arn)
    }

    /// Poll until the function state is `Active` and no update is in progress
    pub async fn wait_until_active(&self) -> Result<()> {
        let what = format!("function {} to become active", self.settings.function_name);
        poll_until(&what, self.poll_interval, self.poll_timeout, move || async move {
            let config = self
                .client
                .get_function_configuration()
                .function_name(&self.settings.function_name)
                .send()
                .await?;
            let state = config.state().map(|s| s.as_str().to_string());
            let update = config.last_update_status().map(|s| s.as_str().to_string());
            debug!(state = ?state, last_update = ?update, "Function status");

            match (state.as_deref(), update.as_deref()) {
                (Some("Failed"), _) | (_, Some("Failed")) => Err(KitError::AwsError {
                    code: Some("FunctionFailed".to_string()),
                    message: config
                        .state_reason()
                        .or(config.last_update_status_reason())
                        .unwrap_or("function entered Failed state")
                        .to_string(),
                }),
                (Some("Active"), Some("InProgress")) => Ok(Poll::Pending),
                (Some("Active"), _) => Ok(Poll::Ready(())),
                _ => Ok(Poll::Pending),
            }
        })
        .await
    }

    /// Allow `bedrock.amazonaws.com` to invoke the function from this account's agents
    ///
    /// An existing statement with the same id is kept.
    pub async fn add_resource_policy(&self) -> Result<()> {
        let result = self
            .client
            .add_permission()
            .function_name(&self.settings.function_name)
            .statement_id(PERMISSION_STATEMENT_ID)
            .action("lambda:InvokeFunction")
            .principal(BEDROCK_PRINCIPAL)
            .source_account(&self.account_id)
            .source_arn(arn::all_agents(&self.region, &self.account_id))
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(function = %self.settings.function_name, "Added resource-based policy");
                Ok(())
            }
            Err(err) => {
                let err = KitError::from(err);
                if err.is_conflict() {
                    warn!(
                        function = %self.settings.function_name,
                        "Resource-based policy already exists"
                    );
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Replace the function's environment
    pub async fn update_environment(&self, environment: HashMap<String, String>) -> Result<()> {
        debug!(keys = ?environment.keys().collect::<Vec<_>>(), "Updating function environment");
        self.client
            .update_function_configuration()
            .function_name(&self.settings.function_name)
            .environment(
                Environment::builder()
                    .set_variables(Some(environment))
                    .build(),
            )
            .send()
            .await?;
        self.wait_until_active().await
    }
}

/// Delete the function; `false` when it did not exist
pub async fn delete_function(client: &Client, function_name: &str) -> Result<bool> {
    match client.delete_function().function_name(function_name).send().await {
        Ok(_) => {
            info!(function = %function_name, "Deleted function");
            Ok(true)
        }
        Err(err) => {
            let err = KitError::from(err);
            if err.is_not_found() {
                debug!(function = %function_name, "Function not found");
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::NamedTempFile;

    #[test]
    fn test_package_contains_executable_bootstrap() {
        let package = package_bootstrap_bytes(b"\x7fELF fake handler").unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(package)).unwrap();
        assert_eq!(archive.len(), 1);

        let mut entry = archive.by_name(BOOTSTRAP_NAME).unwrap();
        assert_eq!(entry.unix_mode().map(|m| m & 0o777), Some(0o755));

        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"\x7fELF fake handler");
    }

    #[test]
    fn test_package_from_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"binary").unwrap();
        let package = package_bootstrap(file.path()).unwrap();
        assert!(!package.is_empty());
    }

    #[test]
    fn test_missing_executable_is_packaging_error() {
        let err = package_bootstrap(Path::new("/nonexistent/bootstrap")).unwrap_err();
        assert!(matches!(err, KitError::PackagingError { .. }));
    }
}
