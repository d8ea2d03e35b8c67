//! Transports carrying MCP messages
//!
//! The servers used by the inline agents are local processes (usually
//! `docker run -i`) that speak line-delimited JSON-RPC on stdin/stdout.
//! [`StdioTransport`] spawns such a process; [`InMemoryTransport`] hands
//! channel-backed streams to the client so the protocol can be driven without
//! a process.

use crate::mcp::docker::ServerParams;
use crate::mcp::error::McpOperationError;
use crate::mcp::types::McpMessage;
use crate::utils::logging::sanitize_for_logging;
use async_trait::async_trait;
use futures::sink::Sink;
use futures::stream::Stream;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<McpMessage, McpOperationError>> + Send>>;
pub type MessageSink = Pin<Box<dyn Sink<McpMessage, Error = McpOperationError> + Send>>;

/// Time a server gets to exit after SIGTERM before it is killed
pub const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Read and write halves of a connected transport
pub struct TransportStreams {
    pub read_stream: MessageStream,
    pub write_stream: MessageSink,
}

impl std::fmt::Debug for TransportStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStreams")
            .field("read_stream", &"<message_stream>")
            .field("write_stream", &"<message_sink>")
            .finish()
    }
}

/// A channel to one MCP server
///
/// `connect` establishes the channel and returns its streams; the client owns
/// the protocol on top of them. Streams are `Send` but not `Sync`, so a
/// transport is only ever reached through `&mut` behind the client's lock.
#[async_trait]
pub trait McpTransport: Send {
    async fn connect(&mut self) -> Result<TransportStreams, McpOperationError>;

    async fn disconnect(&mut self) -> Result<(), McpOperationError>;

    fn is_connected(&self) -> bool;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

fn channel_sink(tx: mpsc::UnboundedSender<McpMessage>) -> MessageSink {
    Box::pin(futures::sink::unfold(tx, |tx, msg| async move {
        tx.send(msg)
            .map_err(|_| McpOperationError::transport("Channel closed"))
            .map(|_| tx)
    }))
}

fn channel_stream(rx: mpsc::UnboundedReceiver<Result<McpMessage, McpOperationError>>) -> MessageStream {
    Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
}

/// Spawns the server process and talks to it over stdin/stdout
pub struct StdioTransport {
    params: ServerParams,
    child: Option<Child>,
    close_sender: Option<mpsc::UnboundedSender<()>>,
}

impl StdioTransport {
    pub fn new(params: ServerParams) -> Self {
        Self {
            params,
            child: None,
            close_sender: None,
        }
    }

    pub fn params(&self) -> &ServerParams {
        &self.params
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> Result<TransportStreams, McpOperationError> {
        if self.params.command.is_empty() {
            return Err(McpOperationError::transport("Command cannot be empty"));
        }

        let mut cmd = Command::new(&self.params.command);
        cmd.args(&self.params.args)
            .envs(&self.params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpOperationError::process(format!(
                "Failed to spawn process '{}': {}",
                self.params.command, e
            ))
        })?;
        debug!(endpoint = %self.endpoint(), pid = ?child.id(), "Spawned MCP server");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpOperationError::process("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpOperationError::process("Failed to get stdout handle"))?;
        let stderr = child.stderr.take();

        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<McpMessage>();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        self.child = Some(child);
        self.close_sender = Some(close_tx);

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                tokio::select! {
                    result = reader.read_line(&mut line) => {
                        match result {
                            Ok(0) => {
                                let _ = read_tx.send(Err(McpOperationError::disconnected("Process stdout closed")));
                                break;
                            }
                            Ok(_) => {
                                let trimmed = line.trim();
                                if !trimmed.is_empty() {
                                    let parsed = serde_json::from_str::<McpMessage>(trimmed).map_err(|e| {
                                        McpOperationError::malformed(format!("Failed to parse MCP message: {}", e))
                                    });
                                    if read_tx.send(parsed).is_err() {
                                        break;
                                    }
                                }
                                line.clear();
                            }
                            Err(e) => {
                                let _ = read_tx.send(Err(McpOperationError::process(format!("Error reading from stdout: {}", e))));
                                break;
                            }
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Dropping unserializable MCP message");
                        continue;
                    }
                };
                if stdin.write_all(format!("{}\n", json).as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Servers log to stderr; an unread pipe would eventually block them.
        if let Some(stderr) = stderr {
            let command = self.params.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // Containers get AWS credentials forwarded and some servers echo them
                    debug!(server = %command, "{}", sanitize_for_logging(&line));
                }
            });
        }

        Ok(TransportStreams {
            read_stream: channel_stream(read_rx),
            write_stream: channel_sink(write_tx),
        })
    }

    async fn disconnect(&mut self) -> Result<(), McpOperationError> {
        if let Some(close_sender) = self.close_sender.take() {
            let _ = close_sender.send(());
        }

        if let Some(mut child) = self.child.take() {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SAFETY: `pid` belongs to a child we spawned and have not reaped.
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                    match tokio::time::timeout(GRACEFUL_SHUTDOWN, child.wait()).await {
                        Ok(Ok(status)) => debug!(pid, %status, "MCP server exited"),
                        _ => {
                            warn!(pid, "MCP server ignored SIGTERM, killing");
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                        }
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
    }

    fn endpoint(&self) -> String {
        self.params.to_string()
    }
}

/// The server side of [`in_memory_streams`]
pub struct InMemoryServer {
    /// Messages pushed here arrive at the client
    pub to_client: mpsc::UnboundedSender<Result<McpMessage, McpOperationError>>,
    /// Messages the client wrote
    pub from_client: mpsc::UnboundedReceiver<McpMessage>,
}

/// Connected channel-backed streams
pub fn in_memory_streams() -> (InMemoryServer, TransportStreams) {
    let (read_tx, read_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let streams = TransportStreams {
        read_stream: channel_stream(read_rx),
        write_stream: channel_sink(write_tx),
    };
    (
        InMemoryServer {
            to_client: read_tx,
            from_client: write_rx,
        },
        streams,
    )
}

/// Transport over pre-built streams; connects exactly once
pub struct InMemoryTransport {
    streams: Option<TransportStreams>,
    connected: bool,
}

impl InMemoryTransport {
    pub fn new(streams: TransportStreams) -> Self {
        Self {
            streams: Some(streams),
            connected: false,
        }
    }

    pub fn pair() -> (InMemoryServer, Self) {
        let (server, streams) = in_memory_streams();
        (server, Self::new(streams))
    }
}

#[async_trait]
impl McpTransport for InMemoryTransport {
    async fn connect(&mut self) -> Result<TransportStreams, McpOperationError> {
        let streams = self
            .streams
            .take()
            .ok_or_else(|| McpOperationError::transport("In-memory transport already used"))?;
        self.connected = true;
        Ok(streams)
    }

    async fn disconnect(&mut self) -> Result<(), McpOperationError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn endpoint(&self) -> String {
        "in-memory".to_string()
    }
}
