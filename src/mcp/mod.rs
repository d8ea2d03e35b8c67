//! Model Context Protocol client
//!
//! Inline agents reach their tools through MCP servers started as local
//! processes. The pieces are layered the usual way:
//!
//! - [`docker`]: command line and environment of a server
//! - [`transport`]: line-delimited JSON-RPC over the process pipes
//! - [`client`]: handshake, request/response matching, tool calls
//!
//! ```no_run
//! use bedrock_agent_kit::mcp::{DockerServer, McpClient, McpClientConfig, StdioTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let params = DockerServer::new("mcp-pinot-server:latest").into_params();
//! let client = McpClient::new("pinot", McpClientConfig::default(), Box::new(StdioTransport::new(params)));
//! client.connect().await?;
//! for tool in client.list_tools().await? {
//!     println!("{}: {}", tool.name, tool.description);
//! }
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod docker;
pub mod error;
pub mod transport;
pub mod types;

pub use client::{McpClient, McpClientConfig};
pub use docker::{DockerServer, ServerParams};
pub use error::McpOperationError;
pub use transport::{in_memory_streams, InMemoryServer, InMemoryTransport, McpTransport, StdioTransport, TransportStreams};
pub use types::{CallToolResult, Content, Tool};

use std::sync::Arc;
use tracing::{info, warn};

/// Connected clients, shut down in reverse connection order
#[derive(Debug, Default)]
pub struct McpClientStack {
    clients: Vec<Arc<McpClient>>,
}

impl McpClientStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `client` and keep it for shutdown
    ///
    /// On failure the clients connected so far are left in place so the
    /// caller's [`shutdown`](Self::shutdown) still stops them.
    pub async fn connect(&mut self, client: McpClient) -> Result<Arc<McpClient>, McpOperationError> {
        client.connect().await?;
        let client = Arc::new(client);
        self.clients.push(client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Disconnect every client, last connected first; returns the names that failed
    pub async fn shutdown(&mut self) -> Vec<String> {
        let mut failed = Vec::new();
        while let Some(client) = self.clients.pop() {
            match client.disconnect().await {
                Ok(()) => info!(client = %client.name(), "MCP client stopped"),
                Err(err) => {
                    warn!(client = %client.name(), error = %err, "Failed to stop MCP client");
                    failed.push(client.name().to_string());
                }
            }
        }
        failed
    }
}
