//! Service roles for the Lambda, the agents and the knowledge base

use super::policy::PolicyDocument;
use crate::error::KitError;
use crate::poll::settle;
use crate::Result;
use aws_sdk_iam::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything needed to create one role
#[derive(Debug, Clone)]
pub struct RoleSpec {
    pub name: String,
    pub description: Option<String>,
    pub trust_policy: PolicyDocument,
    pub managed_policy_arns: Vec<String>,
    /// `(policy name, document)`
    pub inline_policy: Option<(String, PolicyDocument)>,
}

pub struct RoleManager {
    client: Client,
    propagation_delay: Duration,
}

impl RoleManager {
    pub fn new(client: Client, propagation_delay: Duration) -> Self {
        Self {
            client,
            propagation_delay,
        }
    }

    /// ARN of an existing role, or `None` when IAM reports `NoSuchEntity`
    pub async fn find_role(&self, name: &str) -> Result<Option<String>> {
        match self.client.get_role().role_name(name).send().await {
            Ok(output) => Ok(output.role.map(|role| role.arn)),
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

    /// Return the role's ARN, creating and configuring the role first if needed
    ///
    /// An existing role is reused as is; its policies are not touched.
    pub async fn ensure_role(&self, spec: &RoleSpec) -> Result<String> {
        if let Some(arn) = self.find_role(&spec.name).await? {
            info!(role = %spec.name, "Role already exists, reusing it");
            return Ok(arn);
        }

        info!(role = %spec.name, "Creating role");
        let mut request = self
            .client
            .create_role()
            .role_name(&spec.name)
            .assume_role_policy_document(spec.trust_policy.to_json());
        if let Some(description) = &spec.description {
            request = request.description(description);
        }

        let arn = match request.send().await {
            Ok(output) => output
                .role
                .map(|role| role.arn)
                .ok_or_else(|| KitError::internal_error("CreateRole returned no role"))?,
            Err(err) => {
                let err = KitError::from(err);
                if !err.is_conflict() {
                    return Err(err);
                }
                // Created concurrently by another run
                warn!(role = %spec.name, "Role appeared while creating it");
                return self
                    .find_role(&spec.name)
                    .await?
                    .ok_or_else(|| KitError::resource_not_found(format!("role {}", spec.name)));
            }
        };

        for policy_arn in &spec.managed_policy_arns {
            debug!(role = %spec.name, policy = %policy_arn, "Attaching managed policy");
            self.client
                .attach_role_policy()
                .role_name(&spec.name)
                .policy_arn(policy_arn)
                .send()
                .await?;
        }

        if let Some((policy_name, document)) = &spec.inline_policy {
            debug!(role = %spec.name, policy = %policy_name, "Putting inline policy");
            self.client
                .put_role_policy()
                .role_name(&spec.name)
                .policy_name(policy_name)
                .policy_document(document.to_json())
                .send()
                .await?;
        }

        settle(self.propagation_delay, "IAM role propagation").await;
        Ok(arn)
    }

    /// Detach managed policies, delete inline policies, then delete the role
    ///
    /// Returns `false` when the role did not exist.
    pub async fn delete_role(&self, name: &str) -> Result<bool> {
        if self.find_role(name).await?.is_none() {
            debug!(role = %name, "Role not found, nothing to delete");
            return Ok(false);
        }

        let attached = self
            .client
            .list_attached_role_policies()
            .role_name(name)
            .send()
            .await?;
        for policy in attached.attached_policies.unwrap_or_default() {
            if let Some(policy_arn) = policy.policy_arn() {
                self.client
                    .detach_role_policy()
                    .role_name(name)
                    .policy_arn(policy_arn)
                    .send()
                    .await?;
            }
        }

        let inline = self.client.list_role_policies().role_name(name).send().await?;
        for policy_name in inline.policy_names {
            self.client
                .delete_role_policy()
                .role_name(name)
                .policy_name(policy_name)
                .send()
                .await?;
        }

        self.client.delete_role().role_name(name).send().await?;
        info!(role = %name, "Deleted role");
        Ok(true)
    }
}
