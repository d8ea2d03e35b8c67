//! Shared AWS configuration and service clients

use crate::error::KitError;
use crate::Result;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// One loaded `SdkConfig` plus a client per service the recipes touch
///
/// Clients are cheap handles over the shared configuration, so they are built
/// eagerly and cloned out by the accessors.
#[derive(Debug, Clone)]
pub struct AwsContext {
    sdk_config: SdkConfig,
    region: String,
    account_id: OnceCell<String>,
    bedrock_agent: aws_sdk_bedrockagent::Client,
    bedrock_agent_runtime: aws_sdk_bedrockagentruntime::Client,
    dynamodb: aws_sdk_dynamodb::Client,
    iam: aws_sdk_iam::Client,
    lambda: aws_sdk_lambda::Client,
    s3: aws_sdk_s3::Client,
    sts: aws_sdk_sts::Client,
}

impl AwsContext {
    /// Load credentials and region from the default provider chain
    ///
    /// An explicit `region` wins over `AWS_REGION` and profile settings;
    /// `us-east-1` is used when nothing is configured.
    pub async fn load(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self::from_sdk_config(sdk_config)
    }

    pub fn from_sdk_config(sdk_config: SdkConfig) -> Self {
        let region = sdk_config
            .region()
            .map(|r| r.as_ref().to_string())
            .unwrap_or_else(|| "us-east-1".to_string());

        debug!(region = %region, "AWS clients configured");

        Self {
            bedrock_agent: aws_sdk_bedrockagent::Client::new(&sdk_config),
            bedrock_agent_runtime: aws_sdk_bedrockagentruntime::Client::new(&sdk_config),
            dynamodb: aws_sdk_dynamodb::Client::new(&sdk_config),
            iam: aws_sdk_iam::Client::new(&sdk_config),
            lambda: aws_sdk_lambda::Client::new(&sdk_config),
            s3: aws_sdk_s3::Client::new(&sdk_config),
            sts: aws_sdk_sts::Client::new(&sdk_config),
            account_id: OnceCell::new(),
            region,
            sdk_config,
        }
    }

    /// Pin the account id instead of asking STS
    pub fn with_account_id(self, account_id: impl Into<String>) -> Self {
        Self {
            account_id: OnceCell::new_with(Some(account_id.into())),
            ..self
        }
    }

    pub fn sdk_config(&self) -> &SdkConfig {
        &self.sdk_config
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Caller account id, resolved once through `GetCallerIdentity`
    pub async fn account_id(&self) -> Result<String> {
        let id = self
            .account_id
            .get_or_try_init(|| async {
                let identity = self.sts.get_caller_identity().send().await?;
                let account = identity.account().map(str::to_string).ok_or_else(|| {
                    KitError::configuration_error("Caller identity did not include an account id")
                })?;
                info!(account_id = %account, "Resolved caller account");
                Ok::<_, KitError>(account)
            })
            .await?;
        Ok(id.clone())
    }

    pub fn bedrock_agent(&self) -> aws_sdk_bedrockagent::Client {
        self.bedrock_agent.clone()
    }

    pub fn bedrock_agent_runtime(&self) -> aws_sdk_bedrockagentruntime::Client {
        self.bedrock_agent_runtime.clone()
    }

    pub fn dynamodb(&self) -> aws_sdk_dynamodb::Client {
        self.dynamodb.clone()
    }

    pub fn iam(&self) -> aws_sdk_iam::Client {
        self.iam.clone()
    }

    pub fn lambda(&self) -> aws_sdk_lambda::Client {
        self.lambda.clone()
    }

    pub fn s3(&self) -> aws_sdk_s3::Client {
        self.s3.clone()
    }
}

/// ARN builders
pub mod arn {
    /// Cross-region inference profile, e.g. `us.anthropic.claude-3-5-haiku-...`
    pub fn inference_profile(region: &str, account_id: &str, profile_id: &str) -> String {
        format!(
            "arn:aws:bedrock:{}:{}:inference-profile/{}",
            region, account_id, profile_id
        )
    }

    pub fn foundation_model(region: &str, model_id: &str) -> String {
        format!("arn:aws:bedrock:{}::foundation-model/{}", region, model_id)
    }

    /// Every agent in the account, as used in the Lambda resource policy
    pub fn all_agents(region: &str, account_id: &str) -> String {
        format!("arn:aws:bedrock:{}:{}:agent/*", region, account_id)
    }

    pub fn lambda_function(region: &str, account_id: &str, function_name: &str) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{}",
            region, account_id, function_name
        )
    }

    pub fn s3_bucket(bucket: &str) -> String {
        format!("arn:aws:s3:::{}", bucket)
    }

    pub fn s3_objects(bucket: &str) -> String {
        format!("arn:aws:s3:::{}/*", bucket)
    }

    pub fn iam_role(account_id: &str, role_name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", account_id, role_name)
    }

    /// Model ARN for an agent; inference profiles carry a region prefix (`us.`)
    pub fn agent_model(region: &str, account_id: &str, model_id: &str) -> String {
        let is_profile = model_id
            .split_once('.')
            .map(|(prefix, _)| prefix.len() == 2 || prefix == "apac")
            .unwrap_or(false);
        if is_profile {
            inference_profile(region, account_id, model_id)
        } else {
            foundation_model(region, model_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::arn;
    use super::*;

    #[test]
    fn test_agent_model_arn_for_inference_profile() {
        assert_eq!(
            arn::agent_model(
                "us-west-2",
                "123456789012",
                "us.anthropic.claude-3-5-haiku-20241022-v1:0"
            ),
            "arn:aws:bedrock:us-west-2:123456789012:inference-profile/us.anthropic.claude-3-5-haiku-20241022-v1:0"
        );
    }

    #[test]
    fn test_agent_model_arn_for_foundation_model() {
        assert_eq!(
            arn::agent_model("us-east-1", "123456789012", "anthropic.claude-v2"),
            "arn:aws:bedrock:us-east-1::foundation-model/anthropic.claude-v2"
        );
        assert_eq!(
            arn::foundation_model("us-east-1", "amazon.titan-embed-text-v2:0"),
            "arn:aws:bedrock:us-east-1::foundation-model/amazon.titan-embed-text-v2:0"
        );
    }

    #[test]
    fn test_resource_arns() {
        assert_eq!(
            arn::all_agents("us-east-1", "123456789012"),
            "arn:aws:bedrock:us-east-1:123456789012:agent/*"
        );
        assert_eq!(arn::s3_objects("letters"), "arn:aws:s3:::letters/*");
        assert_eq!(
            arn::lambda_function("eu-west-1", "1", "BedrockAgentHandler"),
            "arn:aws:lambda:eu-west-1:1:function:BedrockAgentHandler"
        );
    }

    #[tokio::test]
    async fn test_pinned_account_skips_sts() {
        let sdk_config = SdkConfig::builder()
            .region(Region::new("us-west-2"))
            .behavior_version(BehaviorVersion::latest())
            .build();
        let aws = AwsContext::from_sdk_config(sdk_config).with_account_id("123456789012");
        assert_eq!(aws.region(), "us-west-2");
        assert_eq!(aws.account_id().await.unwrap(), "123456789012");
    }
}
