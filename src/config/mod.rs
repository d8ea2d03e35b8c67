//! Configuration for the multi-agent recipes
//!
//! [`KitConfig`] holds every name, model id, and wait used by setup, invoke, and
//! cleanup. Defaults reproduce the shareholder-letter metadata-filtering setup:
//! one knowledge base, one action-group Lambda, two year-scoped sub-agents and a
//! routing orchestrator. Files may be TOML, YAML, or JSON; a handful of
//! environment variables override file values.
//!
//! Inline-agent sessions read their secrets from the environment instead; see
//! [`app_env::AgentAppConfig`].

pub mod app_env;

use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub use app_env::AgentAppConfig;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable parsing error: {0}")]
    EnvVarParse(String),
    #[error("File parsing error: {0}")]
    FileParse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KitConfig {
    #[serde(default)]
    pub aws: AwsSettings,
    #[serde(default)]
    pub models: ModelSettings,
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseSettings,
    #[serde(default)]
    pub lambda: LambdaSettings,
    #[serde(default)]
    pub agents: AgentSettings,
    #[serde(default)]
    pub waits: WaitSettings,
}

/// Account and region
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AwsSettings {
    /// Region override; falls back to the SDK default chain
    pub region: Option<String>,
    /// Account id; resolved through STS when absent
    pub account_id: Option<String>,
    /// Account that owns the inference profiles, if not the caller's
    pub inference_profile_account: Option<String>,
}

/// Model identifiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Inference profile id used by the deployed agents and the handler
    #[serde(default = "default_agent_model")]
    pub agent_model_id: String,
    /// Embedding model for the knowledge base
    #[serde(default = "default_embedding_model")]
    pub embedding_model_id: String,
    /// Foundation model for inline-agent sessions
    #[serde(default = "default_inline_model")]
    pub inline_model_id: String,
}

/// Knowledge base and its vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseSettings {
    #[serde(default = "default_kb_name")]
    pub name: String,
    #[serde(default = "default_kb_description")]
    pub description: String,
    /// IAM role assumed by the knowledge base; derived from the name when absent
    pub role_name: Option<String>,
    /// Data source name; derived from the bucket when absent
    pub data_source_name: Option<String>,
    /// Existing vector store; required only when the knowledge base must be created
    pub vector_store: Option<VectorStoreSettings>,
}

/// OpenSearch Serverless collection and index backing a new knowledge base
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreSettings {
    pub collection_arn: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_vector_field")]
    pub vector_field: String,
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(default = "default_metadata_field")]
    pub metadata_field: String,
}

/// Action-group Lambda deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LambdaSettings {
    #[serde(default = "default_function_name")]
    pub function_name: String,
    #[serde(default = "default_lambda_role")]
    pub role_name: String,
    /// Prebuilt `bootstrap` executable of the `kb-action-handler` binary
    #[serde(default = "default_bootstrap_path")]
    pub bootstrap_path: PathBuf,
    #[serde(default = "default_lambda_runtime")]
    pub runtime: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default = "default_lambda_timeout")]
    pub timeout_seconds: i32,
    #[serde(default = "default_lambda_memory")]
    pub memory_mb: i32,
}

/// One year-scoped sub-agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubAgentSettings {
    pub name: String,
    pub instruction: String,
    pub alias_name: String,
    /// Knowledge-base document this agent is restricted to
    pub document: String,
}

/// The routing orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    #[serde(default = "default_orchestrator_name")]
    pub name: String,
    #[serde(default = "default_orchestrator_instruction")]
    pub instruction: String,
    #[serde(default = "default_orchestrator_alias")]
    pub alias_name: String,
    #[serde(default = "default_collaboration")]
    pub collaboration: String,
}

/// Agents, their role, and their action group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_role")]
    pub role_name: String,
    #[serde(default = "default_idle_ttl")]
    pub idle_session_ttl_seconds: i32,
    #[serde(default = "default_action_group_name")]
    pub action_group_name: String,
    /// OpenAPI schema file; the built-in retrieval schema is used when absent
    pub api_schema_path: Option<PathBuf>,
    #[serde(default = "default_relay_history")]
    pub relay_conversation_history: String,
    #[serde(default = "default_sub_agents")]
    pub sub_agents: Vec<SubAgentSettings>,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

/// Settle delays and polling limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitSettings {
    /// After creating an IAM role, before anything assumes it
    #[serde(with = "duration_seconds", default = "default_role_propagation")]
    pub role_propagation: Duration,
    /// After associating collaborators, before preparing the orchestrator
    #[serde(with = "duration_seconds", default = "default_collaborator_settle")]
    pub collaborator_settle: Duration,
    /// After disassociating collaborators during cleanup
    #[serde(with = "duration_seconds", default = "default_disassociate_settle")]
    pub disassociate_settle: Duration,
    /// After deleting an agent's aliases
    #[serde(with = "duration_seconds", default = "default_alias_delete_settle")]
    pub alias_delete_settle: Duration,
    #[serde(with = "duration_seconds", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Upper bound for agent, alias, function, and deletion polling
    #[serde(with = "duration_seconds", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    #[serde(with = "duration_seconds", default = "default_ingestion_timeout")]
    pub ingestion_timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            agent_model_id: default_agent_model(),
            embedding_model_id: default_embedding_model(),
            inline_model_id: default_inline_model(),
        }
    }
}

impl Default for KnowledgeBaseSettings {
    fn default() -> Self {
        Self {
            name: default_kb_name(),
            description: default_kb_description(),
            role_name: None,
            data_source_name: None,
            vector_store: None,
        }
    }
}

impl Default for LambdaSettings {
    fn default() -> Self {
        Self {
            function_name: default_function_name(),
            role_name: default_lambda_role(),
            bootstrap_path: default_bootstrap_path(),
            runtime: default_lambda_runtime(),
            architecture: default_architecture(),
            timeout_seconds: default_lambda_timeout(),
            memory_mb: default_lambda_memory(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            name: default_orchestrator_name(),
            instruction: default_orchestrator_instruction(),
            alias_name: default_orchestrator_alias(),
            collaboration: default_collaboration(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            role_name: default_agent_role(),
            idle_session_ttl_seconds: default_idle_ttl(),
            action_group_name: default_action_group_name(),
            api_schema_path: None,
            relay_conversation_history: default_relay_history(),
            sub_agents: default_sub_agents(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            role_propagation: default_role_propagation(),
            collaborator_settle: default_collaborator_settle(),
            disassociate_settle: default_disassociate_settle(),
            alias_delete_settle: default_alias_delete_settle(),
            poll_interval: default_poll_interval(),
            poll_timeout: default_poll_timeout(),
            ingestion_timeout: default_ingestion_timeout(),
        }
    }
}

impl KnowledgeBaseSettings {
    pub fn role_name(&self) -> String {
        self.role_name
            .clone()
            .unwrap_or_else(|| format!("BedrockKbRole-{}", self.name))
    }

    pub fn data_source_name(&self, bucket: &str) -> String {
        self.data_source_name
            .clone()
            .unwrap_or_else(|| format!("{}-s3-source", bucket))
    }
}

impl AgentSettings {
    pub fn sub_agent_names(&self) -> Vec<&str> {
        self.sub_agents.iter().map(|a| a.name.as_str()).collect()
    }
}

impl KitConfig {
    /// Load configuration from a file (supports TOML, YAML, JSON)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let extension = path.extension().and_then(|s| s.to_str());

        match extension {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            _ => Err(ConfigError::FileParse(
                "Unsupported file format. Use .toml, .yaml, .yml, or .json".to_string(),
            )),
        }
    }

    /// Load from an optional file, then apply environment overrides and validate
    ///
    /// `.env` is read first so its values take part in the overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        app_env::ensure_env_loaded();
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (environment takes precedence)
    pub fn merge_with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(region) = env::var("AWS_REGION") {
            if !region.is_empty() {
                self.aws.region = Some(region);
            }
        }
        if let Ok(account_id) = env::var("KIT_ACCOUNT_ID") {
            self.aws.account_id = Some(account_id);
        }
        if let Ok(model) = env::var("KIT_MODEL_ID") {
            self.models.agent_model_id = model;
        }
        if let Ok(model) = env::var("KIT_INLINE_MODEL_ID") {
            self.models.inline_model_id = model;
        }
        if let Ok(path) = env::var("KIT_LAMBDA_BOOTSTRAP") {
            self.lambda.bootstrap_path = PathBuf::from(path);
        }
        if let Ok(secs) = env::var("KIT_POLL_TIMEOUT") {
            self.waits.poll_timeout = Duration::from_secs(
                secs.parse()
                    .map_err(|e| ConfigError::EnvVarParse(format!("KIT_POLL_TIMEOUT: {}", e)))?,
            );
        }
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.agent_model_id.is_empty() {
            return Err(ConfigError::Validation(
                "Agent model id cannot be empty".to_string(),
            ));
        }
        if self.knowledge_base.name.is_empty() {
            return Err(ConfigError::Validation(
                "Knowledge base name cannot be empty".to_string(),
            ));
        }
        if self.agents.sub_agents.is_empty() {
            return Err(ConfigError::Validation(
                "At least one sub-agent must be configured".to_string(),
            ));
        }
        let mut names = self.agents.sub_agent_names();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.agents.sub_agents.len() {
            return Err(ConfigError::Validation(
                "Sub-agent names must be unique".to_string(),
            ));
        }
        if names.contains(&self.agents.orchestrator.name.as_str()) {
            return Err(ConfigError::Validation(
                "Orchestrator name must differ from sub-agent names".to_string(),
            ));
        }
        if !(60..=3600).contains(&self.agents.idle_session_ttl_seconds) {
            return Err(ConfigError::Validation(
                "Idle session TTL must be between 60 and 3600 seconds".to_string(),
            ));
        }
        if self.waits.poll_interval.is_zero() || self.waits.poll_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "Poll interval and timeout must be greater than 0".to_string(),
            ));
        }
        if self.waits.poll_interval > self.waits.poll_timeout {
            return Err(ConfigError::Validation(
                "Poll interval cannot exceed poll timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// Custom serialization for Duration as seconds
mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Default value functions for serde
fn default_agent_model() -> String {
    "us.anthropic.claude-3-5-haiku-20241022-v1:0".to_string()
}

fn default_embedding_model() -> String {
    "amazon.titan-embed-text-v2:0".to_string()
}

fn default_inline_model() -> String {
    "us.anthropic.claude-3-5-sonnet-20241022-v2:0".to_string()
}

fn default_kb_name() -> String {
    "kb-metadatafiltering".to_string()
}

fn default_kb_description() -> String {
    "Knowledge base for shareholder letters".to_string()
}

fn default_index_name() -> String {
    "bedrock-knowledge-base-default-index".to_string()
}

fn default_vector_field() -> String {
    "bedrock-knowledge-base-default-vector".to_string()
}

fn default_text_field() -> String {
    "AMAZON_BEDROCK_TEXT_CHUNK".to_string()
}

fn default_metadata_field() -> String {
    "AMAZON_BEDROCK_METADATA".to_string()
}

fn default_function_name() -> String {
    "BedrockAgentHandler".to_string()
}

fn default_lambda_role() -> String {
    "BedrockAgentLambdaRole".to_string()
}

fn default_bootstrap_path() -> PathBuf {
    PathBuf::from("target/lambda/kb-action-handler/bootstrap")
}

fn default_lambda_runtime() -> String {
    "provided.al2023".to_string()
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

fn default_lambda_timeout() -> i32 {
    900
}

fn default_lambda_memory() -> i32 {
    256
}

fn default_agent_role() -> String {
    "BedrockAgentRole".to_string()
}

fn default_idle_ttl() -> i32 {
    1800
}

fn default_action_group_name() -> String {
    "QueryKnowledgeBase".to_string()
}

fn default_relay_history() -> String {
    "DISABLED".to_string()
}

fn default_orchestrator_name() -> String {
    "OrchestratorAgent2".to_string()
}

fn default_orchestrator_instruction() -> String {
    "You are an orchestrator agent that routes queries to appropriate sub-agents. \
     Route queries about 2020 documents to Agent1 and 2023 documents to Agent2."
        .to_string()
}

fn default_orchestrator_alias() -> String {
    "multi-agent-metadatafilter".to_string()
}

fn default_collaboration() -> String {
    "SUPERVISOR_ROUTER".to_string()
}

fn year_scoped_instruction(year: u32) -> String {
    format!(
        "You are an agent responsible for answering questions ONLY about the {year} shareholder \
         letter. If a question is not about {year}, respond with \"I can only answer questions \
         about the {year} shareholder letter. Please rephrase your question to focus on {year}.\""
    )
}

fn default_sub_agents() -> Vec<SubAgentSettings> {
    vec![
        SubAgentSettings {
            name: "Agent1".to_string(),
            instruction: year_scoped_instruction(2020),
            alias_name: "agent1-metadatafilter".to_string(),
            document: "AMZN-2020-Shareholder-Letter.pdf".to_string(),
        },
        SubAgentSettings {
            name: "Agent2".to_string(),
            instruction: year_scoped_instruction(2023),
            alias_name: "agent2-metadatafilter".to_string(),
            document: "Amazon-com-Inc-2023-Shareholder-Letter.pdf".to_string(),
        },
    ]
}

fn default_role_propagation() -> Duration {
    Duration::from_secs(10)
}

fn default_collaborator_settle() -> Duration {
    Duration::from_secs(60)
}

fn default_disassociate_settle() -> Duration {
    Duration::from_secs(30)
}

fn default_alias_delete_settle() -> Duration {
    Duration::from_secs(15)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_ingestion_timeout() -> Duration {
    Duration::from_secs(1800)
}
