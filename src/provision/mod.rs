//! Provisioning of the metadata-filtering multi-agent setup
//!
//! [`BedrockAgentSetup::run`] goes knowledge base, then Lambda, then agents:
//!
//! 1. create or reuse the knowledge base and ingest the bucket
//! 2. deploy the `kb-action-handler` Lambda with its role and resource policy
//! 3. create each sub-agent with the `QueryKnowledgeBase` action group and an alias
//! 4. create the supervisor, associate the sub-agents, prepare it, alias it
//! 5. point the Lambda at the new agent ids and their documents

pub mod agents;
pub mod iam;
pub mod knowledge_base;
pub mod lambda;
pub mod policy;
pub mod schema;

use crate::aws::AwsContext;
use crate::config::KitConfig;
use crate::Result;
use agents::{handler_environment, AgentProvisioner, Collaborator, DeployedAgent};
use iam::{RoleManager, RoleSpec};
use knowledge_base::KnowledgeBaseManager;
use lambda::{env_keys, LambdaDeployer};
use schema::ApiSchema;
use std::collections::HashMap;
use std::fmt;
use tracing::info;

/// Ids of everything `run` created or reused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupSummary {
    pub knowledge_base_id: String,
    pub data_source_id: Option<String>,
    pub lambda_arn: String,
    pub orchestrator_id: String,
    pub orchestrator_alias_id: String,
    pub orchestrator_alias_arn: String,
    pub sub_agents: Vec<DeployedAgent>,
}

impl fmt::Display for SetupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Knowledge Base ID: {}", self.knowledge_base_id)?;
        writeln!(f, "Lambda Function ARN: {}", self.lambda_arn)?;
        writeln!(f, "Agent IDs:")?;
        writeln!(f, "  Orchestrator: {}", self.orchestrator_id)?;
        writeln!(f, "  Orchestrator Alias ID: {}", self.orchestrator_alias_id)?;
        for agent in &self.sub_agents {
            writeln!(f, "  {}: {} (alias {})", agent.name, agent.agent_id, agent.alias_id)?;
        }
        Ok(())
    }
}

pub struct BedrockAgentSetup<'a> {
    aws: &'a AwsContext,
    config: &'a KitConfig,
    bucket: String,
    synchronize: bool,
}

impl<'a> BedrockAgentSetup<'a> {
    pub fn new(aws: &'a AwsContext, config: &'a KitConfig, bucket: impl Into<String>) -> Self {
        Self {
            aws,
            config,
            bucket: bucket.into(),
            synchronize: true,
        }
    }

    /// Skip the ingestion job (documents already synchronized)
    pub fn without_sync(mut self) -> Self {
        self.synchronize = false;
        self
    }

    fn agent_role_spec(&self, account_id: &str) -> RoleSpec {
        RoleSpec {
            name: self.config.agents.role_name.clone(),
            description: Some("Role for Bedrock Agent to access Lambda and Knowledge Base".to_string()),
            trust_policy: policy::service_trust_policy("bedrock.amazonaws.com"),
            managed_policy_arns: Vec::new(),
            inline_policy: Some((
                "BedrockAgentPolicy".to_string(),
                policy::agent_access_policy(
                    self.aws.region(),
                    account_id,
                    &self.config.lambda.function_name,
                ),
            )),
        }
    }

    pub async fn run(&self) -> Result<SetupSummary> {
        let config = self.config;
        let region = self.aws.region();
        let account_id = self.aws.account_id().await?;
        let model_account_id = config
            .aws
            .inference_profile_account
            .clone()
            .unwrap_or_else(|| account_id.clone());
        let roles = RoleManager::new(self.aws.iam(), config.waits.role_propagation);

        // Knowledge base
        let kb_manager = KnowledgeBaseManager::new(
            self.aws.bedrock_agent(),
            self.aws.s3(),
            &roles,
            &config.knowledge_base,
            &config.waits,
            region,
            &account_id,
        );
        let kb = kb_manager
            .create_or_retrieve(&self.bucket, &config.models.embedding_model_id)
            .await?;
        info!(knowledge_base_id = %kb.knowledge_base_id, "Knowledge base ready");
        if let (true, Some(data_source_id)) = (self.synchronize, &kb.data_source_id) {
            kb_manager
                .synchronize(&kb.knowledge_base_id, data_source_id)
                .await?;
        }

        // Action-group Lambda
        let mut base_environment = HashMap::new();
        base_environment.insert(env_keys::KNOWLEDGE_BASE_ID.to_string(), kb.knowledge_base_id.clone());
        base_environment.insert(env_keys::MODEL_ID.to_string(), config.models.agent_model_id.clone());
        base_environment.insert(env_keys::MODEL_ACCOUNT_ID.to_string(), model_account_id.clone());
        base_environment.insert(env_keys::S3_BUCKET.to_string(), self.bucket.clone());
        base_environment.insert(env_keys::REGION.to_string(), region.to_string());

        let deployer = LambdaDeployer::new(
            self.aws.lambda(),
            &roles,
            &config.lambda,
            region,
            &account_id,
        )
        .with_polling(config.waits.poll_interval, config.waits.poll_timeout);
        let lambda_arn = deployer.deploy_function(base_environment.clone()).await?;
        info!(lambda_arn = %lambda_arn, "Handler deployed");

        // Agents
        let agent_role_arn = roles.ensure_role(&self.agent_role_spec(&account_id)).await?;
        let schema_payload = ApiSchema::load(config.agents.api_schema_path.as_deref())?.payload()?;
        let provisioner = AgentProvisioner::new(
            self.aws.bedrock_agent(),
            &config.agents,
            &config.waits,
            agent_role_arn,
            region,
            &model_account_id,
            &config.models.agent_model_id,
        );

        let mut sub_agents = Vec::with_capacity(config.agents.sub_agents.len());
        for sub_agent in &config.agents.sub_agents {
            let deployed = provisioner
                .create_sub_agent(sub_agent, &lambda_arn, &schema_payload)
                .await?;
            sub_agents.push((deployed, sub_agent));
        }

        let orchestrator_id = provisioner.create_orchestrator().await?;
        let collaborators: Vec<Collaborator> = sub_agents
            .iter()
            .map(|(agent, _)| {
                Collaborator::from_agent(agent, &config.agents.relay_conversation_history)
            })
            .collect();
        let (orchestrator_alias_id, orchestrator_alias_arn) = provisioner
            .associate_sub_agents(&orchestrator_id, &collaborators)
            .await?;

        deployer
            .update_environment(handler_environment(&base_environment, &sub_agents))
            .await?;

        Ok(SetupSummary {
            knowledge_base_id: kb.knowledge_base_id,
            data_source_id: kb.data_source_id,
            lambda_arn,
            orchestrator_id,
            orchestrator_alias_id,
            orchestrator_alias_arn,
            sub_agents: sub_agents.into_iter().map(|(agent, _)| agent).collect(),
        })
    }
}
