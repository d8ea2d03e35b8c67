//! The `InvokeInlineAgent` call behind a trait
//!
//! [`InlineAgent::invoke`](super::InlineAgent::invoke) drives the
//! return-control loop against [`InlineAgentRuntime`]; the agent-runtime
//! [`Client`] is the production implementation.

use crate::error::KitError;
use crate::Result;
use async_trait::async_trait;
use aws_sdk_bedrockagentruntime::types::{
    AgentActionGroup, InlineAgentResponseStream, InlineSessionState, InvocationResultMember,
};
use aws_sdk_bedrockagentruntime::Client;
use futures::stream::{self, BoxStream, StreamExt};

/// Events of one round, in the order the service sent them
pub type InlineEventStream = BoxStream<'static, Result<InlineAgentResponseStream>>;

/// What a round sends after the agent definition
#[derive(Debug, Clone, PartialEq)]
pub enum RoundInput {
    /// The user's text; only the first round carries it
    Text(String),
    /// Outputs of the functions the previous round asked for
    Results {
        invocation_id: String,
        results: Vec<InvocationResultMember>,
    },
}

/// One `InvokeInlineAgent` request
#[derive(Debug, Clone, PartialEq)]
pub struct InlineRound {
    pub session_id: String,
    pub foundation_model: String,
    pub instruction: String,
    pub idle_session_ttl_seconds: i32,
    pub enable_trace: bool,
    pub action_groups: Vec<AgentActionGroup>,
    pub input: RoundInput,
}

#[async_trait]
pub trait InlineAgentRuntime: Send + Sync {
    async fn send_round(&self, round: InlineRound) -> Result<InlineEventStream>;
}

#[async_trait]
impl InlineAgentRuntime for Client {
    async fn send_round(&self, round: InlineRound) -> Result<InlineEventStream> {
        let request = self
            .invoke_inline_agent()
            .session_id(round.session_id)
            .foundation_model(round.foundation_model)
            .instruction(round.instruction)
            .idle_session_ttl_in_seconds(round.idle_session_ttl_seconds)
            .enable_trace(round.enable_trace)
            .set_action_groups(Some(round.action_groups));
        let request = match round.input {
            RoundInput::Text(text) => request.input_text(text),
            RoundInput::Results {
                invocation_id,
                results,
            } => request.inline_session_state(
                InlineSessionState::builder()
                    .invocation_id(invocation_id)
                    .set_return_control_invocation_results(Some(results))
                    .build(),
            ),
        };

        let output = request.send().await?;
        // A receive error ends the stream; the caller stops at the first `Err`.
        let events = stream::unfold(Some(output.completion), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Ok(Some(event)) => Some((Ok(event), Some(receiver))),
                Ok(None) => None,
                Err(err) => Some((Err(KitError::from(err)), None)),
            }
        });
        Ok(events.boxed())
    }
}
