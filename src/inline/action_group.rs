//! Action groups for inline agents
//!
//! An MCP-backed group turns every tool its servers advertise into a Bedrock
//! function executed by return of control: the service hands the call back to
//! us, we run it against the server that owns the tool, and send the output
//! back with the next request. Built-in groups are executed by the service.

use crate::mcp::{CallToolResult, McpClient, McpOperationError, Tool};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Longest function description the service accepts
pub const MAX_FUNCTION_DESCRIPTION: usize = 1200;
/// Longest parameter description the service accepts
pub const MAX_PARAMETER_DESCRIPTION: usize = 500;
/// Longest function or parameter name the service accepts
pub const MAX_NAME: usize = 100;

pub const CODE_INTERPRETER_SIGNATURE: &str = "AMAZON.CodeInterpreter";
pub const USER_INPUT_SIGNATURE: &str = "AMAZON.UserInput";

/// Something that lists and runs tools; implemented by [`McpClient`]
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn tools(&self) -> Result<Vec<Tool>, McpOperationError>;

    async fn call(&self, tool: &str, arguments: Map<String, Value>) -> Result<CallToolResult, McpOperationError>;
}

#[async_trait]
impl ToolProvider for McpClient {
    fn provider_name(&self) -> &str {
        self.name()
    }

    async fn tools(&self) -> Result<Vec<Tool>, McpOperationError> {
        self.list_tools().await
    }

    async fn call(&self, tool: &str, arguments: Map<String, Value>) -> Result<CallToolResult, McpOperationError> {
        self.call_tool(tool, arguments).await
    }
}

#[derive(Clone)]
pub enum ActionGroupKind {
    /// Functions come from the tools of these providers
    Mcp(Vec<Arc<dyn ToolProvider>>),
    /// Executed by the service, identified by its parent signature
    BuiltIn(&'static str),
}

impl fmt::Debug for ActionGroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionGroupKind::Mcp(providers) => f
                .debug_tuple("Mcp")
                .field(&providers.iter().map(|p| p.provider_name()).collect::<Vec<_>>())
                .finish(),
            ActionGroupKind::BuiltIn(signature) => f.debug_tuple("BuiltIn").field(signature).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionGroup {
    pub name: String,
    pub description: Option<String>,
    pub kind: ActionGroupKind,
}

impl ActionGroup {
    pub fn mcp(name: impl Into<String>, providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        Self {
            name: name.into(),
            description: None,
            kind: ActionGroupKind::Mcp(providers),
        }
    }

    pub fn code_interpreter() -> Self {
        Self {
            name: "CodeInterpreter".to_string(),
            description: None,
            kind: ActionGroupKind::BuiltIn(CODE_INTERPRETER_SIGNATURE),
        }
    }

    pub fn user_input() -> Self {
        Self {
            name: "UserInput".to_string(),
            description: None,
            kind: ActionGroupKind::BuiltIn(USER_INPUT_SIGNATURE),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// JSON-schema types the service can express
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    /// Sent to the model as a string holding JSON
    Object,
}

impl ParameterKind {
    fn from_schema(schema: &Value) -> Self {
        let kind = match schema.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            // ["string", "null"] and friends
            Some(Value::Array(kinds)) => kinds
                .iter()
                .filter_map(Value::as_str)
                .find(|k| *k != "null")
                .unwrap_or("string"),
            _ => "string",
        };
        match kind {
            "integer" => ParameterKind::Integer,
            "number" => ParameterKind::Number,
            "boolean" => ParameterKind::Boolean,
            "array" => ParameterKind::Array,
            "object" => ParameterKind::Object,
            _ => ParameterKind::String,
        }
    }

    /// Parameter type as the service spells it
    pub fn service_type(self) -> &'static str {
        match self {
            ParameterKind::String | ParameterKind::Object => "string",
            ParameterKind::Integer => "integer",
            ParameterKind::Number => "number",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Array => "array",
        }
    }

    /// Turn the string the service returns back into the JSON the tool expects
    pub fn parse(self, raw: &str) -> Value {
        let parsed = match self {
            ParameterKind::String => None,
            ParameterKind::Integer => raw.trim().parse::<i64>().ok().map(Value::from),
            ParameterKind::Number => raw.trim().parse::<f64>().ok().map(Value::from),
            ParameterKind::Boolean => raw.trim().to_ascii_lowercase().parse::<bool>().ok().map(Value::from),
            ParameterKind::Array | ParameterKind::Object => serde_json::from_str(raw).ok(),
        };
        parsed.unwrap_or_else(|| Value::String(raw.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionParameter {
    pub name: String,
    /// Property name in the tool's schema
    pub property: String,
    pub description: String,
    pub kind: ParameterKind,
    pub required: bool,
}

/// A tool as the service sees it
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<FunctionParameter>,
}

/// Map a tool name onto `^([0-9a-zA-Z][_-]?){1,100}$`
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut after_separator = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            after_separator = false;
        } else if !after_separator {
            out.push(if c == '-' { '-' } else { '_' });
            after_separator = true;
        }
    }
    while out.ends_with(['_', '-']) {
        out.pop();
    }
    if out.len() > MAX_NAME {
        out.truncate(MAX_NAME);
        while out.ends_with(['_', '-']) {
            out.pop();
        }
    }
    if out.is_empty() {
        out.push_str("tool");
    }
    out
}

/// Cut `text` to at most `limit` characters, marking the cut
pub fn truncate_description(text: &str, limit: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(limit.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

impl FunctionSpec {
    pub fn from_tool(tool: &Tool) -> Self {
        let required: Vec<&str> = tool
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut parameters = Vec::new();
        if let Some(properties) = tool.input_schema.get("properties").and_then(Value::as_object) {
            for (property, schema) in properties {
                let description = schema
                    .get("description")
                    .or_else(|| schema.get("title"))
                    .and_then(Value::as_str)
                    .unwrap_or(property);
                parameters.push(FunctionParameter {
                    name: sanitize_name(property),
                    property: property.clone(),
                    description: truncate_description(description, MAX_PARAMETER_DESCRIPTION),
                    kind: ParameterKind::from_schema(schema),
                    required: required.contains(&property.as_str()),
                });
            }
        }

        let description = if tool.description.trim().is_empty() {
            tool.name.clone()
        } else {
            tool.description.clone()
        };

        Self {
            name: sanitize_name(&tool.name),
            description: truncate_description(&description, MAX_FUNCTION_DESCRIPTION),
            parameters,
        }
    }
}

/// A function call handed back by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub action_group: String,
    pub function: String,
    /// `(name, value)` pairs as strings
    pub parameters: Vec<(String, String)>,
}

/// Output for one [`FunctionCall`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionOutcome {
    pub action_group: String,
    pub function: String,
    pub body: String,
    pub failed: bool,
}

impl FunctionOutcome {
    fn failure(call: &FunctionCall, body: impl Into<String>) -> Self {
        Self {
            action_group: call.action_group.clone(),
            function: call.function.clone(),
            body: body.into(),
            failed: true,
        }
    }
}

struct RegisteredTool {
    provider: Arc<dyn ToolProvider>,
    tool_name: String,
    spec: FunctionSpec,
}

/// Resolved MCP action group
#[derive(Debug, Clone)]
pub struct ResolvedGroup {
    pub name: String,
    pub description: Option<String>,
    pub functions: Vec<FunctionSpec>,
    pub built_in: Option<&'static str>,
}

/// Where each function of each action group runs
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<(String, String), RegisteredTool>,
}

impl ToolRegistry {
    /// List the tools of every MCP-backed group
    ///
    /// A function name seen twice in one group keeps the first provider.
    pub async fn resolve(groups: &[ActionGroup]) -> Result<(Self, Vec<ResolvedGroup>), McpOperationError> {
        let mut registry = Self::default();
        let mut resolved = Vec::with_capacity(groups.len());

        for group in groups {
            match &group.kind {
                ActionGroupKind::BuiltIn(signature) => resolved.push(ResolvedGroup {
                    name: group.name.clone(),
                    description: group.description.clone(),
                    functions: Vec::new(),
                    built_in: Some(*signature),
                }),
                ActionGroupKind::Mcp(providers) => {
                    let mut functions = Vec::new();
                    for provider in providers {
                        for tool in provider.tools().await? {
                            let spec = FunctionSpec::from_tool(&tool);
                            let key = (group.name.clone(), spec.name.clone());
                            if registry.tools.contains_key(&key) {
                                warn!(
                                    action_group = %group.name,
                                    function = %spec.name,
                                    provider = %provider.provider_name(),
                                    "Duplicate function name, keeping the first"
                                );
                                continue;
                            }
                            debug!(action_group = %group.name, function = %spec.name, provider = %provider.provider_name(), "Registered tool");
                            functions.push(spec.clone());
                            registry.tools.insert(
                                key,
                                RegisteredTool {
                                    provider: provider.clone(),
                                    tool_name: tool.name.clone(),
                                    spec,
                                },
                            );
                        }
                    }
                    resolved.push(ResolvedGroup {
                        name: group.name.clone(),
                        description: group.description.clone(),
                        functions,
                        built_in: None,
                    });
                }
            }
        }
        Ok((registry, resolved))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run one call; every failure becomes a failed outcome
    pub async fn execute(&self, call: &FunctionCall) -> FunctionOutcome {
        let key = (call.action_group.clone(), call.function.clone());
        let Some(registered) = self.tools.get(&key) else {
            warn!(action_group = %call.action_group, function = %call.function, "Unknown function requested");
            return FunctionOutcome::failure(
                call,
                format!("Unknown function {} in action group {}", call.function, call.action_group),
            );
        };

        let mut arguments = Map::new();
        for (name, raw) in &call.parameters {
            match registered.spec.parameters.iter().find(|p| &p.name == name) {
                Some(parameter) => {
                    arguments.insert(parameter.property.clone(), parameter.kind.parse(raw));
                }
                None => {
                    arguments.insert(name.clone(), Value::String(raw.clone()));
                }
            }
        }

        match registered.provider.call(&registered.tool_name, arguments).await {
            Ok(result) if result.is_error() => {
                FunctionOutcome::failure(call, result.text_output())
            }
            Ok(result) => FunctionOutcome {
                action_group: call.action_group.clone(),
                function: call.function.clone(),
                body: result.text_output(),
                failed: false,
            },
            Err(err) => {
                warn!(function = %call.function, provider = %registered.provider.provider_name(), error = %err, "Tool call failed");
                FunctionOutcome::failure(call, format!("Error calling {}: {}", registered.tool_name, err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeProvider {
        name: String,
        tools: Vec<Tool>,
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
        fail: bool,
    }

    impl FakeProvider {
        fn new(name: &str, tools: Vec<Tool>) -> Self {
            Self {
                name: name.to_string(),
                tools,
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ToolProvider for FakeProvider {
        fn provider_name(&self) -> &str {
            &self.name
        }

        async fn tools(&self) -> Result<Vec<Tool>, McpOperationError> {
            Ok(self.tools.clone())
        }

        async fn call(&self, tool: &str, arguments: Map<String, Value>) -> Result<CallToolResult, McpOperationError> {
            self.calls.lock().unwrap().push((tool.to_string(), arguments));
            if self.fail {
                return Err(McpOperationError::disconnected("Process stdout closed"));
            }
            Ok(CallToolResult::text(format!("{} done", tool)))
        }
    }

    fn tool(name: &str, schema: Value) -> Tool {
        Tool {
            name: name.to_string(),
            description: format!("{} description", name),
            input_schema: schema,
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("list_log_groups"), "list_log_groups");
        assert_eq!(sanitize_name("jira.create issue"), "jira_create_issue");
        assert_eq!(sanitize_name("__weird__name!!"), "weird_name");
        assert_eq!(sanitize_name("a--b"), "a-b");
        assert_eq!(sanitize_name("???"), "tool");
        assert_eq!(sanitize_name(&"x".repeat(150)).len(), MAX_NAME);
    }

    #[test]
    fn test_truncate_description() {
        assert_eq!(truncate_description("  short  ", 10), "short");
        let long = "d".repeat(MAX_FUNCTION_DESCRIPTION + 50);
        let cut = truncate_description(&long, MAX_FUNCTION_DESCRIPTION);
        assert_eq!(cut.chars().count(), MAX_FUNCTION_DESCRIPTION);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_function_spec_from_schema() {
        let spec = FunctionSpec::from_tool(&tool(
            "fetch_logs",
            json!({
                "type": "object",
                "properties": {
                    "log_group_name": {"type": "string", "description": "Log group"},
                    "hours": {"type": "integer"},
                    "filters": {"type": "object"},
                    "verbose": {"type": ["boolean", "null"]}
                },
                "required": ["log_group_name"]
            }),
        ));

        assert_eq!(spec.name, "fetch_logs");
        assert_eq!(spec.parameters.len(), 4);
        let by_name = |n: &str| spec.parameters.iter().find(|p| p.name == n).unwrap();
        assert!(by_name("log_group_name").required);
        assert_eq!(by_name("log_group_name").description, "Log group");
        assert_eq!(by_name("hours").kind, ParameterKind::Integer);
        assert!(!by_name("hours").required);
        assert_eq!(by_name("hours").description, "hours");
        assert_eq!(by_name("filters").kind.service_type(), "string");
        assert_eq!(by_name("verbose").kind, ParameterKind::Boolean);
    }

    #[test]
    fn test_parameter_parsing_falls_back_to_string() {
        assert_eq!(ParameterKind::Integer.parse("24"), json!(24));
        assert_eq!(ParameterKind::Integer.parse("many"), json!("many"));
        assert_eq!(ParameterKind::Boolean.parse("True"), json!(true));
        assert_eq!(ParameterKind::Number.parse("2.5"), json!(2.5));
        assert_eq!(ParameterKind::Array.parse("[\"a\",\"b\"]"), json!(["a", "b"]));
        assert_eq!(ParameterKind::Object.parse("{\"k\":1}"), json!({"k": 1}));
        assert_eq!(ParameterKind::String.parse("42"), json!("42"));
    }

    #[tokio::test]
    async fn test_registry_dispatches_to_owning_provider() {
        let monitoring = Arc::new(FakeProvider::new(
            "monitoring",
            vec![tool(
                "fetch_logs",
                json!({"properties": {"hours": {"type": "integer"}}}),
            )],
        ));
        let jira = Arc::new(FakeProvider::new(
            "jira",
            vec![tool("create_jira_issue", json!({"properties": {"summary": {"type": "string"}}}))],
        ));
        let groups = vec![
            ActionGroup::mcp(
                "CloudGuardMCP",
                vec![monitoring.clone() as Arc<dyn ToolProvider>, jira.clone() as Arc<dyn ToolProvider>],
            ),
            ActionGroup::code_interpreter(),
        ];

        let (registry, resolved) = ToolRegistry::resolve(&groups).await.unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].functions.len(), 2);
        assert_eq!(resolved[1].built_in, Some(CODE_INTERPRETER_SIGNATURE));

        let outcome = registry
            .execute(&FunctionCall {
                action_group: "CloudGuardMCP".to_string(),
                function: "fetch_logs".to_string(),
                parameters: vec![("hours".to_string(), "6".to_string())],
            })
            .await;
        assert!(!outcome.failed);
        assert_eq!(outcome.body, "fetch_logs done");

        let calls = monitoring.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["hours"], json!(6));
        assert!(jira.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_function_and_tool_failure_become_failures() {
        let mut broken = FakeProvider::new("pinot", vec![tool("read_query", json!({}))]);
        broken.fail = true;
        let groups = vec![ActionGroup::mcp("PinotMCPGroup", vec![Arc::new(broken) as Arc<dyn ToolProvider>])];
        let (registry, _) = ToolRegistry::resolve(&groups).await.unwrap();

        let unknown = registry
            .execute(&FunctionCall {
                action_group: "PinotMCPGroup".to_string(),
                function: "drop_table".to_string(),
                parameters: Vec::new(),
            })
            .await;
        assert!(unknown.failed);
        assert!(unknown.body.contains("Unknown function drop_table"));

        let failed = registry
            .execute(&FunctionCall {
                action_group: "PinotMCPGroup".to_string(),
                function: "read_query".to_string(),
                parameters: Vec::new(),
            })
            .await;
        assert!(failed.failed);
        assert!(failed.body.contains("read_query"));
    }

    #[tokio::test]
    async fn test_duplicate_function_keeps_first_provider() {
        let first = Arc::new(FakeProvider::new("a", vec![tool("search", json!({}))]));
        let second = Arc::new(FakeProvider::new("b", vec![tool("search", json!({}))]));
        let groups = vec![ActionGroup::mcp(
            "Group",
            vec![first.clone() as Arc<dyn ToolProvider>, second.clone() as Arc<dyn ToolProvider>],
        )];
        let (registry, resolved) = ToolRegistry::resolve(&groups).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(resolved[0].functions.len(), 1);

        registry
            .execute(&FunctionCall {
                action_group: "Group".to_string(),
                function: "search".to_string(),
                parameters: Vec::new(),
            })
            .await;
        assert_eq!(first.calls.lock().unwrap().len(), 1);
        assert!(second.calls.lock().unwrap().is_empty());
    }
}
