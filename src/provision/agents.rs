//! Sub-agents, the supervisor orchestrator and their collaboration

use crate::aws::arn;
use crate::config::{AgentSettings, SubAgentSettings, WaitSettings};
use crate::error::KitError;
use crate::poll::{settle, wait_for_stable_status, ResourceStatus};
use crate::Result;
use aws_sdk_bedrockagent::types::{
    ActionGroupExecutor, ActionGroupState, AgentCollaboration, AgentDescriptor, ApiSchema as AgentApiSchema,
    RelayConversationHistory,
};
use aws_sdk_bedrockagent::Client;
use std::collections::HashMap;
use tracing::{debug, info};

pub const DRAFT_VERSION: &str = "DRAFT";

/// A created agent and the alias pointing at its prepared version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedAgent {
    pub name: String,
    pub agent_id: String,
    pub instruction: String,
    pub alias_id: String,
    pub alias_arn: String,
}

/// What the orchestrator needs to know about one collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collaborator {
    pub alias_arn: String,
    pub name: String,
    pub instruction: String,
    pub relay_conversation_history: String,
}

impl Collaborator {
    pub fn from_agent(agent: &DeployedAgent, relay_conversation_history: &str) -> Self {
        Self {
            alias_arn: agent.alias_arn.clone(),
            name: agent.name.clone(),
            instruction: agent.instruction.clone(),
            relay_conversation_history: relay_conversation_history.to_string(),
        }
    }
}

/// Lambda environment mapping each sub-agent id to the document it may read
///
/// Sub-agent `n` (1-based, in configuration order) gets `AGENT<n>_ID` and `DOC_<n>`.
pub fn handler_environment(
    base: &HashMap<String, String>,
    sub_agents: &[(DeployedAgent, &SubAgentSettings)],
) -> HashMap<String, String> {
    let mut environment = base.clone();
    for (index, (agent, settings)) in sub_agents.iter().enumerate() {
        let n = index + 1;
        environment.insert(format!("AGENT{}_ID", n), agent.agent_id.clone());
        environment.insert(format!("DOC_{}", n), settings.document.clone());
    }
    environment
}

pub struct AgentProvisioner<'a> {
    client: Client,
    settings: &'a AgentSettings,
    waits: &'a WaitSettings,
    role_arn: String,
    model_arn: String,
}

impl<'a> AgentProvisioner<'a> {
    pub fn new(
        client: Client,
        settings: &'a AgentSettings,
        waits: &'a WaitSettings,
        role_arn: impl Into<String>,
        region: &str,
        model_account_id: &str,
        model_id: &str,
    ) -> Self {
        Self {
            client,
            settings,
            waits,
            role_arn: role_arn.into(),
            model_arn: arn::agent_model(region, model_account_id, model_id),
        }
    }

    pub fn model_arn(&self) -> &str {
        &self.model_arn
    }

    async fn agent_status(&self, agent_id: &str) -> Result<String> {
        let output = self.client.get_agent().agent_id(agent_id).send().await?;
        Ok(output
            .agent
            .map(|agent| agent.agent_status.as_str().to_string())
            .unwrap_or_default())
    }

    /// Wait until the agent leaves any `*ING` status; fails if it ends up `FAILED`
    pub async fn wait_for_agent(&self, agent_id: &str) -> Result<ResourceStatus> {
        let status = wait_for_stable_status(
            &format!("agent {}", agent_id),
            self.waits.poll_interval,
            self.waits.poll_timeout,
            || self.agent_status(agent_id),
        )
        .await?;
        info!(agent_id, status = status.as_str(), "Agent status settled");
        if status.as_str() == "FAILED" {
            return Err(KitError::AwsError {
                code: Some("FAILED".to_string()),
                message: format!("agent {} failed", agent_id),
            });
        }
        Ok(status)
    }

    async fn create_agent(
        &self,
        name: &str,
        instruction: &str,
        collaboration: Option<&str>,
    ) -> Result<String> {
        info!(agent = %name, model = %self.model_arn, "Creating agent");
        let mut request = self
            .client
            .create_agent()
            .agent_name(name)
            .agent_resource_role_arn(&self.role_arn)
            .instruction(instruction)
            .foundation_model(&self.model_arn)
            .idle_session_ttl_in_seconds(self.settings.idle_session_ttl_seconds);
        if let Some(collaboration) = collaboration {
            request = request.agent_collaboration(AgentCollaboration::from(collaboration));
        }

        let output = request.send().await.map_err(|err| match KitError::from(err) {
            KitError::Conflict { message } => KitError::conflict(format!(
                "agent {} already exists; run cleanup first ({})",
                name, message
            )),
            other => other,
        })?;

        let agent_id = output
            .agent
            .map(|agent| agent.agent_id)
            .ok_or_else(|| KitError::internal_error("CreateAgent returned no agent"))?;
        self.wait_for_agent(&agent_id).await?;
        Ok(agent_id)
    }

    async fn prepare(&self, agent_id: &str) -> Result<()> {
        info!(agent_id, "Preparing agent");
        self.client.prepare_agent().agent_id(agent_id).send().await?;
        self.wait_for_agent(agent_id).await?;
        Ok(())
    }

    /// Create an alias and wait for it to leave `CREATING`; returns `(id, arn)`
    pub async fn create_alias(&self, agent_id: &str, alias_name: &str) -> Result<(String, String)> {
        info!(agent_id, alias = %alias_name, "Creating agent alias");
        let output = self
            .client
            .create_agent_alias()
            .agent_id(agent_id)
            .agent_alias_name(alias_name)
            .send()
            .await?;
        let alias = output
            .agent_alias
            .ok_or_else(|| KitError::internal_error("CreateAgentAlias returned no alias"))?;
        let alias_id = alias.agent_alias_id;
        let alias_arn = alias.agent_alias_arn;

        let alias_ref = alias_id.as_str();
        let status = wait_for_stable_status(
            &format!("alias {} of agent {}", alias_id, agent_id),
            self.waits.poll_interval,
            self.waits.poll_timeout,
            move || async move {
                let output = self
                    .client
                    .get_agent_alias()
                    .agent_id(agent_id)
                    .agent_alias_id(alias_ref)
                    .send()
                    .await?;
                Ok(output
                    .agent_alias
                    .map(|alias| alias.agent_alias_status.as_str().to_string())
                    .unwrap_or_default())
            },
        )
        .await?;
        if status.as_str() != "PREPARED" {
            return Err(KitError::AwsError {
                code: Some(status.as_str().to_string()),
                message: format!("alias {} of agent {} is not usable", alias_name, agent_id),
            });
        }

        Ok((alias_id, alias_arn))
    }

    /// Create a year-scoped sub-agent with the knowledge-base action group
    pub async fn create_sub_agent(
        &self,
        sub_agent: &SubAgentSettings,
        lambda_arn: &str,
        api_schema_payload: &str,
    ) -> Result<DeployedAgent> {
        let agent_id = self
            .create_agent(&sub_agent.name, &sub_agent.instruction, None)
            .await?;

        debug!(agent_id = %agent_id, action_group = %self.settings.action_group_name, "Creating action group");
        self.client
            .create_agent_action_group()
            .agent_id(&agent_id)
            .agent_version(DRAFT_VERSION)
            .action_group_name(&self.settings.action_group_name)
            .action_group_executor(ActionGroupExecutor::Lambda(lambda_arn.to_string()))
            .api_schema(AgentApiSchema::Payload(api_schema_payload.to_string()))
            .action_group_state(ActionGroupState::Enabled)
            .send()
            .await?;

        self.prepare(&agent_id).await?;
        let (alias_id, alias_arn) = self.create_alias(&agent_id, &sub_agent.alias_name).await?;

        info!(agent = %sub_agent.name, agent_id = %agent_id, alias_id = %alias_id, "Sub-agent ready");
        Ok(DeployedAgent {
            name: sub_agent.name.clone(),
            agent_id,
            instruction: sub_agent.instruction.clone(),
            alias_id,
            alias_arn,
        })
    }

    /// Create the supervisor agent (no collaborators yet)
    pub async fn create_orchestrator(&self) -> Result<String> {
        let orchestrator = &self.settings.orchestrator;
        self.create_agent(
            &orchestrator.name,
            &orchestrator.instruction,
            Some(&orchestrator.collaboration),
        )
        .await
    }

    /// Attach collaborators to the orchestrator's draft, prepare it and give it an alias
    pub async fn associate_sub_agents(
        &self,
        orchestrator_id: &str,
        collaborators: &[Collaborator],
    ) -> Result<(String, String)> {
        for collaborator in collaborators {
            info!(
                orchestrator_id,
                collaborator = %collaborator.name,
                "Associating collaborator"
            );
            self.client
                .associate_agent_collaborator()
                .agent_id(orchestrator_id)
                .agent_version(DRAFT_VERSION)
                .agent_descriptor(
                    AgentDescriptor::builder()
                        .alias_arn(&collaborator.alias_arn)
                        .build(),
                )
                .collaborator_name(&collaborator.name)
                .collaboration_instruction(&collaborator.instruction)
                .relay_conversation_history(RelayConversationHistory::from(
                    collaborator.relay_conversation_history.as_str(),
                ))
                .send()
                .await?;
        }

        settle(self.waits.collaborator_settle, "collaborators to attach").await;
        self.prepare(orchestrator_id).await?;
        self.create_alias(orchestrator_id, &self.settings.orchestrator.alias_name)
            .await
    }
}
