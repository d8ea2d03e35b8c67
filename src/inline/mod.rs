//! Inline agents backed by MCP servers
//!
//! An inline agent is defined per request: model, instruction and action
//! groups travel with every `InvokeInlineAgent` call. Tools from MCP servers
//! are executed locally through return of control, so one user input can take
//! several round trips:
//!
//! 1. send the input with the action groups
//! 2. stream answer chunks until the service either finishes or returns control
//! 3. run the requested functions and send their results in the session state
//! 4. repeat from 2 with the same session and invocation id

pub mod action_group;
pub mod bedrock;
pub mod presets;
pub mod runtime;

pub use action_group::{ActionGroup, FunctionCall, FunctionOutcome, ToolProvider, ToolRegistry};
pub use presets::{run_preset, Preset, PresetRun};
pub use runtime::{InlineAgentRuntime, InlineEventStream, InlineRound, RoundInput};

use crate::error::KitError;
use crate::invoke::trace::{trace_item, TraceItem};
use crate::Result;
use aws_sdk_bedrockagentruntime::types::{InlineAgentFilePart, InlineAgentResponseStream};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_IDLE_SESSION_TTL_SECONDS: i32 = 600;
pub const DEFAULT_MAX_ROUNDS: usize = 25;

/// What one `invoke` produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineAnswer {
    pub session_id: String,
    pub text: String,
    pub trace_items: Vec<TraceItem>,
    pub tool_calls: usize,
    pub failed_tool_calls: usize,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct InlineAgent {
    pub foundation_model: String,
    pub instruction: String,
    pub agent_name: String,
    pub action_groups: Vec<ActionGroup>,
    pub enable_trace: bool,
    pub idle_session_ttl_seconds: i32,
    pub max_rounds: usize,
    /// Where files produced by the code interpreter are written
    pub output_dir: Option<PathBuf>,
}

impl InlineAgent {
    pub fn new(
        foundation_model: impl Into<String>,
        instruction: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            foundation_model: foundation_model.into(),
            instruction: instruction.into(),
            agent_name: agent_name.into(),
            action_groups: Vec::new(),
            enable_trace: false,
            idle_session_ttl_seconds: DEFAULT_IDLE_SESSION_TTL_SECONDS,
            max_rounds: DEFAULT_MAX_ROUNDS,
            output_dir: None,
        }
    }

    pub fn with_action_group(mut self, group: ActionGroup) -> Self {
        self.action_groups.push(group);
        self
    }

    pub fn with_trace(mut self, enable: bool) -> Self {
        self.enable_trace = enable;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Run `input` to a final answer, writing chunks to `out` as they arrive
    pub async fn invoke(
        &self,
        runtime: &dyn InlineAgentRuntime,
        session_id: &str,
        input: &str,
        out: &mut (dyn Write + Send),
    ) -> Result<InlineAnswer> {
        let (registry, resolved) = ToolRegistry::resolve(&self.action_groups).await?;
        let mut groups = Vec::with_capacity(resolved.len());
        for group in &resolved {
            if group.built_in.is_none() && group.functions.is_empty() {
                warn!(action_group = %group.name, "Action group has no tools, leaving it out");
                continue;
            }
            groups.push(bedrock::agent_action_group(group)?);
        }
        info!(
            agent = %self.agent_name,
            model = %self.foundation_model,
            session_id,
            action_groups = groups.len(),
            functions = registry.len(),
            "Invoking inline agent"
        );

        let mut answer = InlineAnswer {
            session_id: session_id.to_string(),
            ..Default::default()
        };
        let mut next_input = RoundInput::Text(input.to_string());

        for round in 0..self.max_rounds {
            let mut events = runtime
                .send_round(InlineRound {
                    session_id: session_id.to_string(),
                    foundation_model: self.foundation_model.clone(),
                    instruction: self.instruction.clone(),
                    idle_session_ttl_seconds: self.idle_session_ttl_seconds,
                    enable_trace: self.enable_trace,
                    action_groups: groups.clone(),
                    input: next_input.clone(),
                })
                .await?;
            let mut return_control = None;
            while let Some(event) = events.next().await {
                match event? {
                    InlineAgentResponseStream::Chunk(part) => {
                        if let Some(bytes) = part.bytes() {
                            let text = String::from_utf8_lossy(bytes.as_ref());
                            out.write_all(text.as_bytes())?;
                            out.flush()?;
                            answer.text.push_str(&text);
                        }
                    }
                    InlineAgentResponseStream::Trace(part) => {
                        if let Some(item) = part.trace().and_then(trace_item) {
                            debug!(agent = %self.agent_name, "{}", item);
                            answer.trace_items.push(item);
                        }
                    }
                    InlineAgentResponseStream::ReturnControl(payload) => return_control = Some(payload),
                    InlineAgentResponseStream::Files(part) => {
                        answer.files.extend(self.save_files(&part)?);
                    }
                    other => debug!(event = ?other, "Ignoring inline agent event"),
                }
            }

            let Some(payload) = return_control else {
                info!(
                    agent = %self.agent_name,
                    rounds = round + 1,
                    tool_calls = answer.tool_calls,
                    "Inline agent finished"
                );
                return Ok(answer);
            };

            let invocation_id = payload.invocation_id().unwrap_or_default().to_string();
            let calls = bedrock::function_calls(&payload);
            debug!(invocation_id = %invocation_id, calls = calls.len(), "Agent returned control");
            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                info!(action_group = %call.action_group, function = %call.function, "Running tool");
                let outcome = registry.execute(call).await;
                answer.tool_calls += 1;
                if outcome.failed {
                    answer.failed_tool_calls += 1;
                }
                results.push(bedrock::function_result(&outcome)?);
            }
            next_input = RoundInput::Results {
                invocation_id,
                results,
            };
        }

        Err(KitError::internal_error(format!(
            "inline agent {} still returning control after {} rounds",
            self.agent_name, self.max_rounds
        )))
    }

    fn save_files(&self, part: &InlineAgentFilePart) -> Result<Vec<PathBuf>> {
        let Some(dir) = self.output_dir.as_deref() else {
            debug!(count = part.files().len(), "No output directory, skipping files");
            return Ok(Vec::new());
        };
        std::fs::create_dir_all(dir)?;
        let mut saved = Vec::new();
        for file in part.files() {
            let (Some(name), Some(bytes)) = (file.name(), file.bytes()) else {
                continue;
            };
            let path = output_path(dir, name);
            std::fs::write(&path, bytes.as_ref())?;
            info!(path = %path.display(), "Saved agent file");
            saved.push(path);
        }
        Ok(saved)
    }
}

/// Keep only the final component of a service-provided file name
fn output_path(dir: &Path, name: &str) -> PathBuf {
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    dir.join(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{CallToolResult, McpOperationError, Tool};
    use async_trait::async_trait;
    use aws_sdk_bedrockagentruntime::primitives::Blob;
    use aws_sdk_bedrockagentruntime::types::{
        FunctionInvocationInput, FunctionParameter as SdkParameter, InlineAgentPayloadPart,
        InlineAgentReturnControlPayload, InvocationInputMember, InvocationResultMember, ResponseState,
    };
    use serde_json::{json, Map, Value};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays canned rounds and records every request
    struct ScriptedRuntime {
        rounds: Mutex<VecDeque<Vec<InlineAgentResponseStream>>>,
        /// Served once the script runs out
        repeat: Option<Vec<InlineAgentResponseStream>>,
        sent: Mutex<Vec<InlineRound>>,
    }

    impl ScriptedRuntime {
        fn new(rounds: Vec<Vec<InlineAgentResponseStream>>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into()),
                repeat: None,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn repeating(events: Vec<InlineAgentResponseStream>) -> Self {
            Self {
                repeat: Some(events),
                ..Self::new(Vec::new())
            }
        }

        fn sent(&self) -> Vec<InlineRound> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InlineAgentRuntime for ScriptedRuntime {
        async fn send_round(&self, round: InlineRound) -> Result<InlineEventStream> {
            self.sent.lock().unwrap().push(round);
            let events = self
                .rounds
                .lock()
                .unwrap()
                .pop_front()
                .or_else(|| self.repeat.clone())
                .ok_or_else(|| KitError::internal_error("script exhausted"))?;
            Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }

    /// `get_alarms` always fails, everything else echoes its arguments
    struct MonitoringTools;

    #[async_trait]
    impl ToolProvider for MonitoringTools {
        fn provider_name(&self) -> &str {
            "cloudwatch"
        }

        async fn tools(&self) -> std::result::Result<Vec<Tool>, McpOperationError> {
            let schema = json!({
                "type": "object",
                "properties": {"hours": {"type": "integer", "description": "Look-back window"}},
            });
            Ok(["fetch_logs", "get_alarms"]
                .into_iter()
                .map(|name| Tool {
                    name: name.to_string(),
                    description: format!("{} from CloudWatch", name),
                    input_schema: schema.clone(),
                })
                .collect())
        }

        async fn call(
            &self,
            tool: &str,
            arguments: Map<String, Value>,
        ) -> std::result::Result<CallToolResult, McpOperationError> {
            if tool == "get_alarms" {
                return Err(McpOperationError::disconnected("Process stdout closed"));
            }
            Ok(CallToolResult::text(format!("{} {}", tool, Value::Object(arguments))))
        }
    }

    fn chunk(text: &str) -> InlineAgentResponseStream {
        InlineAgentResponseStream::Chunk(InlineAgentPayloadPart::builder().bytes(Blob::new(text.as_bytes())).build())
    }

    fn return_control(invocation_id: &str, function: &str) -> InlineAgentResponseStream {
        InlineAgentResponseStream::ReturnControl(
            InlineAgentReturnControlPayload::builder()
                .invocation_id(invocation_id)
                .invocation_inputs(InvocationInputMember::FunctionInvocationInput(
                    FunctionInvocationInput::builder()
                        .action_group("CloudWatchMCP")
                        .function(function)
                        .parameters(SdkParameter::builder().name("hours").r#type("integer").value("6").build())
                        .build()
                        .unwrap(),
                ))
                .build(),
        )
    }

    fn monitoring_agent() -> InlineAgent {
        InlineAgent::new("us.amazon.nova-pro-v1:0", "Investigate alarms", "monitoring_agent")
            .with_action_group(ActionGroup::mcp("CloudWatchMCP", vec![Arc::new(MonitoringTools) as Arc<dyn ToolProvider>]))
    }

    fn response_states(input: &RoundInput) -> Vec<Option<ResponseState>> {
        match input {
            RoundInput::Results { results, .. } => results
                .iter()
                .map(|result| match result {
                    InvocationResultMember::FunctionResult(result) => result.response_state().cloned(),
                    other => panic!("unexpected result {:?}", other),
                })
                .collect(),
            RoundInput::Text(text) => panic!("expected results, got text {:?}", text),
        }
    }

    #[tokio::test]
    async fn test_return_control_rounds_until_answer() {
        let runtime = ScriptedRuntime::new(vec![
            vec![chunk("Checking logs. "), return_control("inv-1", "fetch_logs")],
            vec![return_control("inv-2", "get_alarms")],
            vec![chunk("No alarms "), chunk("are firing.")],
        ]);
        let mut out = Vec::new();

        let answer = monitoring_agent()
            .invoke(&runtime, "session-1", "Any alarms in the last 6 hours?", &mut out)
            .await
            .unwrap();

        assert_eq!(answer.text, "Checking logs. No alarms are firing.");
        assert_eq!(String::from_utf8(out).unwrap(), answer.text);
        assert_eq!(answer.tool_calls, 2);
        assert_eq!(answer.failed_tool_calls, 1);

        let sent = runtime.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|round| round.session_id == "session-1"));
        assert!(sent.iter().all(|round| round.action_groups.len() == 1));
        assert_eq!(sent[0].input, RoundInput::Text("Any alarms in the last 6 hours?".to_string()));

        match &sent[1].input {
            RoundInput::Results { invocation_id, results } => {
                assert_eq!(invocation_id, "inv-1");
                let InvocationResultMember::FunctionResult(result) = &results[0] else {
                    panic!("expected a function result");
                };
                assert_eq!(result.function(), Some("fetch_logs"));
                let body = result.response_body().unwrap()[bedrock::TEXT_RESPONSE].body().unwrap();
                assert_eq!(body, r#"fetch_logs {"hours":6}"#);
            }
            other => panic!("expected results, got {:?}", other),
        }
        assert_eq!(response_states(&sent[1].input), vec![None]);

        assert!(matches!(&sent[2].input, RoundInput::Results { invocation_id, .. } if invocation_id == "inv-2"));
        assert_eq!(response_states(&sent[2].input), vec![Some(ResponseState::Failure)]);
    }

    #[tokio::test]
    async fn test_round_cap_stops_endless_return_control() {
        let runtime = ScriptedRuntime::repeating(vec![return_control("inv-loop", "fetch_logs")]);
        let mut agent = monitoring_agent();
        agent.max_rounds = 2;
        let mut out = Vec::new();

        let err = agent.invoke(&runtime, "session-2", "Loop forever", &mut out).await.unwrap_err();

        assert!(err.to_string().contains("still returning control after 2 rounds"));
        assert_eq!(runtime.sent().len(), 2);
        assert!(out.is_empty());
    }

    #[test]
    fn test_output_path_strips_directories() {
        let dir = Path::new("/tmp/out");
        assert_eq!(output_path(dir, "chart.png"), dir.join("chart.png"));
        assert_eq!(output_path(dir, "../../etc/passwd"), dir.join("passwd"));
        assert_eq!(output_path(dir, ".."), dir.join("output"));
    }

    #[test]
    fn test_builder_defaults() {
        let agent = InlineAgent::new("us.anthropic.claude-3-5-sonnet-20241022-v2:0", "Be helpful", "pinot_agent")
            .with_action_group(ActionGroup::code_interpreter())
            .with_trace(true);
        assert_eq!(agent.action_groups.len(), 1);
        assert!(agent.enable_trace);
        assert_eq!(agent.idle_session_ttl_seconds, DEFAULT_IDLE_SESSION_TTL_SECONDS);
        assert_eq!(agent.max_rounds, DEFAULT_MAX_ROUNDS);
        assert!(agent.output_dir.is_none());
    }
}
