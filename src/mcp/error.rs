//! Errors raised while talking to an MCP server

use crate::error::KitError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpOperationError {
    /// The server process could not be started or one of its pipes failed
    #[error("MCP server process: {message}")]
    ProcessError { message: String },

    /// A channel between the client and the transport tasks closed
    #[error("MCP transport: {message}")]
    TransportError { message: String },

    /// A line from the server was not a JSON-RPC message we understand
    #[error("Malformed MCP message: {message}")]
    MalformedMessage { message: String },

    #[error("No MCP response within {}ms", duration.as_millis())]
    TimeoutError { duration: Duration },

    /// Used before `connect` or after `disconnect`
    #[error("MCP session: {message}")]
    SessionError { message: String },

    #[error("MCP server went away: {message}")]
    Disconnected { message: String },

    /// JSON-RPC error object returned by the server
    #[error("MCP server replied with error {code}: {message}")]
    RpcError { code: i32, message: String },

    #[error("Tool {tool_name} failed: {message}")]
    ToolFailed { tool_name: String, message: String },
}

impl McpOperationError {
    pub fn process(message: impl Into<String>) -> Self {
        Self::ProcessError {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn timeout(duration: Duration) -> Self {
        Self::TimeoutError { duration }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::SessionError {
            message: message.into(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Disconnected {
            message: message.into(),
        }
    }

    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::RpcError {
            code,
            message: message.into(),
        }
    }

    pub fn tool_failed(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// The server process or its pipes are gone; the client cannot recover
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ProcessError { .. } | Self::TransportError { .. } | Self::Disconnected { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }
}

impl From<serde_json::Error> for McpOperationError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

impl From<McpOperationError> for KitError {
    fn from(err: McpOperationError) -> Self {
        KitError::mcp_error(err.to_string())
    }
}
