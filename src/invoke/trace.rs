//! Reading orchestration traces
//!
//! With tracing enabled an agent streams [`TracePart`]s next to its answer. The
//! orchestration traces carry the model's rationale for each step and the
//! action-group requests it made, which is where generated SQL shows up.

use aws_sdk_bedrockagentruntime::types::{OrchestrationTrace, Trace, TracePart};
use std::fmt;

/// Request-body parameter holding generated SQL
pub const SQL_QUERY_PARAMETER: &str = "SQLQuery";
const JSON_CONTENT_TYPE: &str = "application/json";

/// One step of the agent's reasoning, in stream order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceItem {
    Rationale(String),
    Query(String),
}

impl fmt::Display for TraceItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceItem::Rationale(text) => write!(f, "[rationale] {}", text),
            TraceItem::Query(sql) => write!(f, "[query] {}", sql),
        }
    }
}

/// Token counts reported by orchestration model invocations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub invocations: usize,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

fn orchestration(part: &TracePart) -> Option<&OrchestrationTrace> {
    match part.trace()? {
        Trace::OrchestrationTrace(orchestration) => Some(orchestration),
        _ => None,
    }
}

fn query_of(orchestration: &OrchestrationTrace) -> Option<String> {
    let OrchestrationTrace::InvocationInput(input) = orchestration else {
        return None;
    };
    input
        .action_group_invocation_input()?
        .request_body()?
        .content()?
        .get(JSON_CONTENT_TYPE)?
        .iter()
        .find(|parameter| parameter.name() == Some(SQL_QUERY_PARAMETER))
        .and_then(|parameter| parameter.value())
        .map(str::to_string)
}

/// Rationale or SQL query carried by a single trace event
pub fn trace_item(trace: &Trace) -> Option<TraceItem> {
    let Trace::OrchestrationTrace(orchestration) = trace else {
        return None;
    };
    match orchestration {
        OrchestrationTrace::Rationale(rationale) => rationale
            .text()
            .map(|text| TraceItem::Rationale(text.to_string())),
        other => query_of(other).map(TraceItem::Query),
    }
}

/// Rationales and SQL queries, in the order they appeared
pub fn extract_items(parts: &[TracePart]) -> Vec<TraceItem> {
    parts
        .iter()
        .filter_map(|part| part.trace())
        .filter_map(trace_item)
        .collect()
}

/// Sum of the usage metadata over all orchestration model outputs
pub fn token_usage(parts: &[TracePart]) -> TokenUsage {
    let mut usage = TokenUsage::default();
    for orchestration in parts.iter().filter_map(orchestration) {
        let OrchestrationTrace::ModelInvocationOutput(output) = orchestration else {
            continue;
        };
        if let Some(reported) = output.metadata().and_then(|m| m.usage()) {
            usage.invocations += 1;
            usage.input_tokens += i64::from(reported.input_tokens().unwrap_or(0));
            usage.output_tokens += i64::from(reported.output_tokens().unwrap_or(0));
        }
    }
    usage
}
