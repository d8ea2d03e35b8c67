//! Ready-made inline agents
//!
//! Each preset names its MCP servers (in connection order), the action group
//! they share, and the instruction and default input for the agent.

use crate::config::AgentAppConfig;
use crate::inline::action_group::{ActionGroup, ToolProvider};
use crate::inline::{InlineAgent, InlineAnswer};
use crate::mcp::{DockerServer, McpClient, McpClientConfig, McpClientStack, ServerParams, StdioTransport};
use crate::Result;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const CLOUDGUARD_INSTRUCTION: &str = include_str!("../../prompts/cloudguard.md");
const PINOT_INSTRUCTION: &str = include_str!("../../prompts/pinot.md");

pub const MONITORING_IMAGE: &str = "aws-cloudguard-mcp:latest";
pub const MONITORING_SCRIPT: &str = "server_scripts/monitoring_agent_server.py";
pub const JIRA_IMAGE: &str = "aws-jira-mcp:latest";
pub const JIRA_SCRIPT: &str = "server_scripts/diagnosis_agent_server.py";
pub const PINOT_IMAGE: &str = "mcp-pinot-server:latest";
pub const PERPLEXITY_IMAGE: &str = "mcp/perplexity-ask";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// CloudWatch monitoring plus Jira tickets, with the code interpreter
    CloudGuard,
    /// Pinot tables and queries
    Pinot,
    /// Pinot plus Perplexity web search
    PinotPerplexity,
}

/// One MCP server of a preset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: &'static str,
    pub params: ServerParams,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::CloudGuard, Preset::Pinot, Preset::PinotPerplexity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::CloudGuard => "cloudguard",
            Preset::Pinot => "pinot",
            Preset::PinotPerplexity => "pinot-perplexity",
        }
    }

    pub fn agent_name(&self) -> &'static str {
        match self {
            Preset::CloudGuard => "cloudguard_agent",
            Preset::Pinot | Preset::PinotPerplexity => "pinot_agent",
        }
    }

    pub fn action_group_name(&self) -> &'static str {
        match self {
            Preset::CloudGuard => "CloudGuardMCP",
            Preset::Pinot | Preset::PinotPerplexity => "PinotMCPGroup",
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            Preset::CloudGuard => CLOUDGUARD_INSTRUCTION,
            Preset::Pinot | Preset::PinotPerplexity => PINOT_INSTRUCTION,
        }
    }

    pub fn uses_code_interpreter(&self) -> bool {
        matches!(self, Preset::CloudGuard)
    }

    pub fn default_input(&self) -> &'static str {
        match self {
            Preset::CloudGuard => {
                "List the log groups in my account and look for Bedrock logs. How many model \
                 invocations were there, what share of calls failed, which EC2 instances are in \
                 alarm and what other errors show up? Then:\n\
                 1. Analyze the logs and chart the key metrics (bar charts, pie charts, mermaid diagrams).\n\
                 2. Write a report I can share with my team.\n\
                 3. Create JIRA tickets for any potential errors."
            }
            Preset::Pinot | Preset::PinotPerplexity => {
                "Explore the Pinot tables and query them. Be precise and create a bar graph."
            }
        }
    }

    /// Servers in connection order
    pub fn servers(&self, env: &AgentAppConfig) -> Vec<ServerSpec> {
        let pinot = || ServerSpec {
            name: "pinot",
            params: DockerServer::new(PINOT_IMAGE).env(env.pinot_env()).into_params(),
        };
        match self {
            Preset::CloudGuard => vec![
                ServerSpec {
                    name: "jira",
                    params: DockerServer::new(JIRA_IMAGE)
                        .env(env.jira_env())
                        .arg(JIRA_SCRIPT)
                        .into_params(),
                },
                ServerSpec {
                    name: "monitoring",
                    params: DockerServer::new(MONITORING_IMAGE)
                        .env(env.monitoring_env())
                        .arg(MONITORING_SCRIPT)
                        .into_params(),
                },
            ],
            Preset::Pinot => vec![pinot()],
            Preset::PinotPerplexity => vec![
                pinot(),
                ServerSpec {
                    name: "perplexity",
                    params: DockerServer::new(PERPLEXITY_IMAGE)
                        .env(env.perplexity_env())
                        .into_params(),
                },
            ],
        }
    }

    /// Agent for this preset over already connected providers
    ///
    /// In the CloudGuard group the monitoring tools come before the Jira ones.
    pub fn agent(&self, model_id: &str, providers: Vec<Arc<dyn ToolProvider>>) -> InlineAgent {
        let mut providers = providers;
        if matches!(self, Preset::CloudGuard) {
            providers.reverse();
        }
        let mut agent = InlineAgent::new(model_id, self.instruction().trim(), self.agent_name())
            .with_action_group(ActionGroup::mcp(self.action_group_name(), providers));
        if self.uses_code_interpreter() {
            agent = agent.with_action_group(ActionGroup::code_interpreter());
        }
        agent
    }

    /// Start every server of the preset; connected ones are kept in `stack`
    pub async fn connect(&self, env: &AgentAppConfig, stack: &mut McpClientStack) -> Result<Vec<Arc<dyn ToolProvider>>> {
        let mut providers: Vec<Arc<dyn ToolProvider>> = Vec::new();
        for server in self.servers(env) {
            info!(preset = self.as_str(), server = server.name, command = %server.params, "Starting MCP server");
            let client = McpClient::new(
                server.name,
                McpClientConfig::default(),
                Box::new(StdioTransport::new(server.params)),
            );
            providers.push(stack.connect(client).await?);
        }
        Ok(providers)
    }
}

/// Options for [`run_preset`]
#[derive(Debug, Clone)]
pub struct PresetRun {
    pub model_id: String,
    pub input: Option<String>,
    pub enable_trace: bool,
    pub output_dir: Option<std::path::PathBuf>,
}

/// Start the preset's servers, run one input and stop the servers again
///
/// Servers are stopped in reverse start order whether or not the run succeeded.
pub async fn run_preset(
    client: &aws_sdk_bedrockagentruntime::Client,
    preset: Preset,
    env: &AgentAppConfig,
    run: &PresetRun,
    out: &mut (dyn std::io::Write + Send),
) -> Result<InlineAnswer> {
    let mut stack = McpClientStack::new();
    let result = async {
        let providers = preset.connect(env, &mut stack).await?;
        let mut agent = preset.agent(&run.model_id, providers).with_trace(run.enable_trace);
        if let Some(dir) = &run.output_dir {
            agent = agent.with_output_dir(dir);
        }
        let session_id = Uuid::new_v4().to_string();
        let input = run.input.as_deref().unwrap_or(preset.default_input());
        agent.invoke(client, &session_id, input, out).await
    }
    .await;

    let failed = stack.shutdown().await;
    if !failed.is_empty() {
        warn!(preset = preset.as_str(), clients = ?failed, "Some MCP servers did not stop cleanly");
    }
    result
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Preset::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| format!("unknown preset '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inline::action_group::{ActionGroupKind, CODE_INTERPRETER_SIGNATURE};

    fn env() -> AgentAppConfig {
        AgentAppConfig::from_lookup(|key| match key {
            "AWS_REGION" => Some("us-west-2".to_string()),
            "AWS_ACCESS_KEY_ID" => Some("AKIAEXAMPLE".to_string()),
            "JIRA_USERNAME" => Some("ops@example.com".to_string()),
            "PINOT_BROKER_HOST" => Some("broker.local".to_string()),
            "PERPLEXITY_API_KEY" => Some("pplx-secret".to_string()),
            _ => None,
        })
    }

    #[test]
    fn test_cloudguard_servers_connect_jira_first() {
        let servers = Preset::CloudGuard.servers(&env());
        assert_eq!(servers.iter().map(|s| s.name).collect::<Vec<_>>(), vec!["jira", "monitoring"]);

        let monitoring = &servers[1].params;
        assert_eq!(monitoring.command, "docker");
        assert!(monitoring.args.ends_with(&[MONITORING_IMAGE.to_string(), MONITORING_SCRIPT.to_string()]));
        assert!(monitoring.args.contains(&"AWS_REGION".to_string()));
        assert_eq!(monitoring.env["AWS_REGION"], "us-west-2");
        assert!(!servers[0].params.env.contains_key("AWS_REGION"));
    }

    #[test]
    fn test_pinot_perplexity_servers() {
        let servers = Preset::PinotPerplexity.servers(&env());
        assert_eq!(servers.iter().map(|s| s.name).collect::<Vec<_>>(), vec!["pinot", "perplexity"]);
        assert_eq!(servers[1].params.env["PERPLEXITY_API_KEY"], "pplx-secret");
        assert_eq!(servers[1].params.args.last().map(String::as_str), Some(PERPLEXITY_IMAGE));
        assert_eq!(servers[0].params.env["PINOT_BROKER_HOST"], "broker.local");
    }

    #[test]
    fn test_only_cloudguard_gets_code_interpreter() {
        let cloudguard = Preset::CloudGuard.agent("model", Vec::new());
        assert_eq!(cloudguard.agent_name, "cloudguard_agent");
        assert_eq!(cloudguard.action_groups.len(), 2);
        assert!(matches!(
            cloudguard.action_groups[1].kind,
            ActionGroupKind::BuiltIn(CODE_INTERPRETER_SIGNATURE)
        ));

        let pinot = Preset::Pinot.agent("model", Vec::new());
        assert_eq!(pinot.action_groups.len(), 1);
        assert_eq!(pinot.action_groups[0].name, "PinotMCPGroup");
    }

    #[test]
    fn test_preset_names_parse() {
        for preset in Preset::ALL {
            assert_eq!(preset.to_string().parse::<Preset>().unwrap(), preset);
        }
        assert!("jira".parse::<Preset>().is_err());
    }
}
