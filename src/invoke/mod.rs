//! Calling a deployed agent alias
//!
//! ```no_run
//! # async fn example(client: aws_sdk_bedrockagentruntime::Client) -> bedrock_agent_kit::Result<()> {
//! use bedrock_agent_kit::invoke::AgentInvoker;
//!
//! let answer = AgentInvoker::new(client)
//!     .with_trace()
//!     .with_user_context("analyst", "6f1c0e2a-query")
//!     .invoke("AGENTID", "ALIASID", "Compare the 2020 and 2023 letters")
//!     .await?;
//! for item in answer.trace_items() {
//!     println!("{}", item);
//! }
//! # Ok(())
//! # }
//! ```

pub mod query_results;
pub mod trace;

use crate::error::KitError;
use crate::Result;
use aws_sdk_bedrockagentruntime::types::{ResponseStream, SessionState, TracePart};
use aws_sdk_bedrockagentruntime::Client;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::{debug, error, info};

pub use query_results::{QueryResult, QueryResultsTable};
pub use trace::{extract_items, token_usage, TokenUsage, TraceItem};

/// Session id derived from the query text
///
/// Asking the same question twice lands in the same session.
pub fn session_id_for(query: &str) -> String {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    format!("session-{}", hasher.finish())
}

/// Completion text and, with tracing enabled, the trace parts seen on the stream
#[derive(Debug, Clone)]
pub struct AgentAnswer {
    pub session_id: String,
    pub text: String,
    pub traces: Vec<TracePart>,
}

impl AgentAnswer {
    pub fn trace_items(&self) -> Vec<TraceItem> {
        extract_items(&self.traces)
    }

    pub fn usage(&self) -> TokenUsage {
        token_usage(&self.traces)
    }
}

#[derive(Debug, Clone)]
pub struct AgentInvoker {
    client: Client,
    enable_trace: bool,
    session_id: Option<String>,
    prompt_attributes: HashMap<String, String>,
}

impl AgentInvoker {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            enable_trace: false,
            session_id: None,
            prompt_attributes: HashMap::new(),
        }
    }

    pub fn with_trace(mut self) -> Self {
        self.enable_trace = true;
        self
    }

    /// Fixed session id instead of one derived from the query
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_prompt_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.prompt_attributes.insert(key.into(), value.into());
        self
    }

    /// `userName` and `queryUuid` prompt session attributes
    ///
    /// The SQL action group stores what it ran under `queryUuid`; read it back
    /// with [`QueryResultsTable::fetch`].
    pub fn with_user_context(self, user_name: impl Into<String>, query_uuid: impl Into<String>) -> Self {
        self.with_prompt_attribute("userName", user_name)
            .with_prompt_attribute("queryUuid", query_uuid)
    }

    fn session_state(&self) -> Option<SessionState> {
        if self.prompt_attributes.is_empty() {
            return None;
        }
        Some(
            SessionState::builder()
                .set_prompt_session_attributes(Some(self.prompt_attributes.clone()))
                .build(),
        )
    }

    /// Send `query` to the alias and collect the streamed answer
    pub async fn invoke(&self, agent_id: &str, agent_alias_id: &str, query: &str) -> Result<AgentAnswer> {
        let session_id = self
            .session_id
            .clone()
            .unwrap_or_else(|| session_id_for(query));
        info!(agent_id, agent_alias_id, session_id = %session_id, "Invoking agent");

        let output = self
            .client
            .invoke_agent()
            .agent_id(agent_id)
            .agent_alias_id(agent_alias_id)
            .session_id(&session_id)
            .input_text(query)
            .enable_trace(self.enable_trace)
            .set_session_state(self.session_state())
            .send()
            .await
            .map_err(|err| {
                let err = KitError::from(err);
                error!(agent_id, error = %err, "Couldn't invoke agent");
                err
            })?;

        let mut stream = output.completion;
        let mut text = String::new();
        let mut traces = Vec::new();
        while let Some(event) = stream.recv().await? {
            match event {
                ResponseStream::Chunk(part) => {
                    if let Some(bytes) = part.bytes() {
                        text.push_str(&String::from_utf8_lossy(bytes.as_ref()));
                    }
                }
                ResponseStream::Trace(part) => traces.push(part),
                other => debug!(event = ?other, "Ignoring stream event"),
            }
        }

        debug!(chars = text.len(), traces = traces.len(), "Agent answered");
        Ok(AgentAnswer {
            session_id,
            text,
            traces,
        })
    }
}
