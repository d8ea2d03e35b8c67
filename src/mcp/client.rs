//! MCP client session
//!
//! [`McpClient::connect`] opens the transport, starts the background reader and
//! writer, and performs the `initialize` handshake. Requests are matched to
//! responses by id; every method takes `&self`, so a client can be shared
//! behind an `Arc` by several action groups.

use crate::mcp::error::McpOperationError;
use crate::mcp::transport::{McpTransport, TransportStreams};
use crate::mcp::types::{
    methods, CallToolResult, InitializeResult, ListToolsResult, McpMessage, McpNotification, McpRequest,
    McpResponse, McpResponsePayload, ServerCapabilities, Tool, PROTOCOL_VERSION,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct McpClientConfig {
    pub client_name: String,
    pub client_version: String,
    pub request_timeout: Duration,
    pub protocol_version: String,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: Duration::from_secs(60),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// What the server told us during `initialize`
#[derive(Debug, Clone, Default)]
struct Session {
    capabilities: ServerCapabilities,
    server_name: Option<String>,
    tools: Vec<Tool>,
    tools_stale: bool,
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<McpResponse, McpOperationError>>>>>;

pub struct McpClient {
    name: String,
    config: McpClientConfig,
    transport: Mutex<Box<dyn McpTransport>>,
    session: Arc<RwLock<Session>>,
    next_id: AtomicI64,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<McpMessage>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl McpClient {
    /// `name` labels the client in logs and in tool dispatch errors
    pub fn new(name: impl Into<String>, config: McpClientConfig, transport: Box<dyn McpTransport>) -> Self {
        Self {
            name: name.into(),
            config,
            transport: Mutex::new(transport),
            session: Arc::new(RwLock::new(Session::default())),
            next_id: AtomicI64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            write_tx: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Server name reported by `initialize`
    pub async fn server_name(&self) -> Option<String> {
        self.session.read().await.server_name.clone()
    }

    pub async fn connect(&self) -> Result<(), McpOperationError> {
        if self.is_connected() {
            return Ok(());
        }
        let streams = {
            let mut transport = self.transport.lock().await;
            info!(client = %self.name, endpoint = %transport.endpoint(), "Connecting to MCP server");
            transport.connect().await?
        };
        self.start_message_handler(streams).await;
        self.connected.store(true, Ordering::SeqCst);

        if let Err(err) = self.initialize_session().await {
            error!(client = %self.name, error = %err, "MCP handshake failed");
            let _ = self.disconnect().await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), McpOperationError> {
        self.connected.store(false, Ordering::SeqCst);
        self.write_tx.lock().await.take();
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        fail_pending(&self.pending, "Client disconnected").await;
        let result = self.transport.lock().await.disconnect().await;
        debug!(client = %self.name, "Disconnected from MCP server");
        result
    }

    async fn start_message_handler(&self, streams: TransportStreams) {
        let TransportStreams {
            mut read_stream,
            write_stream,
        } = streams;

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<McpMessage>();
        *self.write_tx.lock().await = Some(write_tx);

        let writer = tokio::spawn(async move {
            let mut sink = write_stream;
            while let Some(message) = write_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    error!("Failed to send MCP message: {}", e);
                    break;
                }
            }
        });

        let pending = self.pending.clone();
        let session = self.session.clone();
        let connected = self.connected.clone();
        let name = self.name.clone();

        let reader = tokio::spawn(async move {
            loop {
                match read_stream.next().await {
                    Some(Ok(message)) => handle_message(&name, message, &pending, &session).await,
                    Some(Err(e)) if e.is_connection_error() => {
                        warn!(client = %name, error = %e, "MCP connection lost");
                        break;
                    }
                    Some(Err(e)) => warn!(client = %name, error = %e, "Skipping unreadable MCP message"),
                    None => {
                        debug!(client = %name, "MCP message stream ended");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            writer.abort();
            fail_pending(&pending, "Connection closed").await;
        });
        *self.reader.lock().await = Some(reader);
    }

    async fn initialize_session(&self) -> Result<(), McpOperationError> {
        let params = json!({
            "protocolVersion": self.config.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            }
        });
        let result: InitializeResult =
            serde_json::from_value(self.request(methods::INITIALIZE, Some(params)).await?)?;
        if result.protocol_version != self.config.protocol_version {
            debug!(
                client = %self.name,
                server_version = %result.protocol_version,
                "Server negotiated a different protocol version"
            );
        }

        let has_tools = result.capabilities.tools.is_some();
        {
            let mut session = self.session.write().await;
            session.capabilities = result.capabilities;
            session.server_name = Some(result.server_info.name.clone()).filter(|n| !n.is_empty());
        }
        self.notify(methods::INITIALIZED, None).await?;
        info!(
            client = %self.name,
            server = %result.server_info.name,
            version = %result.server_info.version,
            "MCP session initialized"
        );

        if has_tools {
            self.refresh_tools().await?;
        }
        Ok(())
    }

    async fn send(&self, message: McpMessage) -> Result<(), McpOperationError> {
        match self.write_tx.lock().await.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| McpOperationError::disconnected("Write channel closed")),
            None => Err(McpOperationError::session("Session not initialized")),
        }
    }

    /// Send a request and return its `result`; an error response becomes `RpcError`
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpOperationError> {
        if !self.is_connected() {
            return Err(McpOperationError::session("Session not initialized"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, response_tx);

        debug!(client = %self.name, id, method, "Sending MCP request");
        if let Err(err) = self.send(McpMessage::Request(McpRequest::new(json!(id), method, params))).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let timeout = self.config.request_timeout;
        let response = match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => response?,
            Ok(Err(_)) => return Err(McpOperationError::transport("Response channel closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                let _ = self
                    .notify(methods::CANCELLED, Some(json!({"requestId": id, "reason": "timeout"})))
                    .await;
                return Err(McpOperationError::timeout(timeout));
            }
        };

        match response.payload {
            McpResponsePayload::Success { result } => Ok(result),
            McpResponsePayload::Error { error } => Err(McpOperationError::rpc(error.code, error.message)),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpOperationError> {
        self.send(McpMessage::Notification(McpNotification::new(method, params)))
            .await
    }

    /// Fetch every page of `tools/list` and cache the result
    ///
    /// The stale flag is cleared before the first page is requested, so a
    /// `list_changed` that arrives mid-refresh triggers the next one.
    pub async fn refresh_tools(&self) -> Result<Vec<Tool>, McpOperationError> {
        self.session.write().await.tools_stale = false;
        match self.fetch_tools().await {
            Ok(tools) => {
                debug!(client = %self.name, count = tools.len(), "Fetched MCP tools");
                self.session.write().await.tools = tools.clone();
                Ok(tools)
            }
            Err(err) => {
                self.session.write().await.tools_stale = true;
                Err(err)
            }
        }
    }

    async fn fetch_tools(&self) -> Result<Vec<Tool>, McpOperationError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult = serde_json::from_value(self.request(methods::LIST_TOOLS, params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Cached tools, refreshed when the server announced a change
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpOperationError> {
        if !self.is_connected() {
            return Err(McpOperationError::session("Session not initialized"));
        }
        let (stale, tools) = {
            let session = self.session.read().await;
            (session.tools_stale, session.tools.clone())
        };
        if stale {
            return self.refresh_tools().await;
        }
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpOperationError> {
        let params = json!({ "name": tool_name, "arguments": arguments });
        info!(client = %self.name, tool = tool_name, "Calling MCP tool");
        let result = self.request(methods::CALL_TOOL, Some(params)).await.map_err(|err| match err {
            McpOperationError::RpcError { message, .. } => McpOperationError::tool_failed(tool_name, message),
            other => other,
        })?;
        Ok(serde_json::from_value(result)?)
    }
}

async fn handle_message(name: &str, message: McpMessage, pending: &PendingMap, session: &Arc<RwLock<Session>>) {
    match message {
        McpMessage::Response(response) => {
            let Some(id) = response.id.as_i64() else {
                warn!(client = %name, id = %response.id, "Response with foreign id");
                return;
            };
            match pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(Ok(response));
                }
                None => debug!(client = %name, id, "Response for unknown or expired request"),
            }
        }
        McpMessage::Notification(notification) => {
            if notification.method == methods::TOOLS_LIST_CHANGED {
                debug!(client = %name, "Server tool list changed");
                session.write().await.tools_stale = true;
            } else {
                debug!(client = %name, method = %notification.method, "Ignoring notification");
            }
        }
        McpMessage::Request(request) => {
            debug!(client = %name, method = %request.method, "Ignoring server request");
        }
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(McpOperationError::disconnected(reason)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::{InMemoryServer, InMemoryTransport};
    use crate::mcp::types::RpcError;

    fn client_with_server(timeout: Duration) -> (McpClient, InMemoryServer) {
        let (server, transport) = InMemoryTransport::pair();
        let config = McpClientConfig {
            request_timeout: timeout,
            ..Default::default()
        };
        (McpClient::new("monitoring", config, Box::new(transport)), server)
    }

    async fn expect_request(server: &mut InMemoryServer, method: &str) -> McpRequest {
        match server.from_client.recv().await {
            Some(McpMessage::Request(request)) => {
                assert_eq!(request.method, method);
                request
            }
            other => panic!("expected {} request, got {:?}", method, other),
        }
    }

    fn reply(server: &InMemoryServer, request: &McpRequest, result: Value) {
        server
            .to_client
            .send(Ok(McpMessage::Response(McpResponse::success(request.id.clone(), result))))
            .unwrap();
    }

    /// Answers the handshake and one `tools/list`
    async fn serve_handshake(server: &mut InMemoryServer) {
        let init = expect_request(server, methods::INITIALIZE).await;
        assert_eq!(init.params.as_ref().unwrap()["protocolVersion"], PROTOCOL_VERSION);
        reply(
            server,
            &init,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "cloudguard-monitoring", "version": "0.1.0"}
            }),
        );
        match server.from_client.recv().await {
            Some(McpMessage::Notification(n)) => assert_eq!(n.method, methods::INITIALIZED),
            other => panic!("expected initialized notification, got {:?}", other),
        }
        let list = expect_request(server, methods::LIST_TOOLS).await;
        reply(
            server,
            &list,
            json!({"tools": [{
                "name": "list_log_groups",
                "description": "List CloudWatch log groups",
                "inputSchema": {"type": "object", "properties": {"prefix": {"type": "string"}}}
            }]}),
        );
    }

    #[tokio::test]
    async fn test_handshake_caches_tools() {
        let (client, mut server) = client_with_server(Duration::from_secs(5));
        let serve = tokio::spawn(async move {
            serve_handshake(&mut server).await;
            server
        });

        client.connect().await.unwrap();
        let _server = serve.await.unwrap();

        assert!(client.is_connected());
        assert_eq!(client.server_name().await.as_deref(), Some("cloudguard-monitoring"));
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "list_log_groups");
    }

    #[tokio::test]
    async fn test_call_tool_round_trip_and_server_error() {
        let (client, mut server) = client_with_server(Duration::from_secs(5));
        let serve = tokio::spawn(async move {
            serve_handshake(&mut server).await;

            let call = expect_request(&mut server, methods::CALL_TOOL).await;
            let params = call.params.clone().unwrap();
            assert_eq!(params["name"], "list_log_groups");
            assert_eq!(params["arguments"]["prefix"], "/aws/lambda");
            reply(&server, &call, json!({"content": [{"type": "text", "text": "2 groups"}]}));

            let failing = expect_request(&mut server, methods::CALL_TOOL).await;
            server
                .to_client
                .send(Ok(McpMessage::Response(McpResponse::error(
                    failing.id.clone(),
                    RpcError::new(RpcError::INTERNAL_ERROR, "boom"),
                ))))
                .unwrap();
            server
        });

        client.connect().await.unwrap();
        let mut arguments = Map::new();
        arguments.insert("prefix".to_string(), json!("/aws/lambda"));
        let result = client.call_tool("list_log_groups", arguments).await.unwrap();
        assert_eq!(result.text_output(), "2 groups");

        let err = client.call_tool("list_log_groups", Map::new()).await.unwrap_err();
        assert!(matches!(err, McpOperationError::ToolFailed { .. }));
        let _server = serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        // The server side stays open but never answers `initialize`.
        let (client, _server) = client_with_server(Duration::from_millis(50));
        let err = client.connect().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_lost_connection_fails_pending_requests() {
        let (client, mut server) = client_with_server(Duration::from_secs(5));
        let serve = tokio::spawn(async move {
            serve_handshake(&mut server).await;
            let _call = expect_request(&mut server, methods::CALL_TOOL).await;
            server
                .to_client
                .send(Err(McpOperationError::disconnected("Process stdout closed")))
                .unwrap();
            server
        });

        client.connect().await.unwrap();
        let err = client.call_tool("list_log_groups", Map::new()).await.unwrap_err();
        assert!(err.is_connection_error());
        let _server = serve.await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_list_changed_during_refresh_is_not_lost() {
        let (client, mut server) = client_with_server(Duration::from_secs(5));
        let serve = tokio::spawn(async move {
            serve_handshake(&mut server).await;

            // The change notice lands before the answer to the refresh it raced with.
            let list = expect_request(&mut server, methods::LIST_TOOLS).await;
            server
                .to_client
                .send(Ok(McpMessage::Notification(McpNotification::new(
                    methods::TOOLS_LIST_CHANGED,
                    None,
                ))))
                .unwrap();
            reply(&server, &list, json!({"tools": [{"name": "list_log_groups", "inputSchema": {}}]}));

            let again = expect_request(&mut server, methods::LIST_TOOLS).await;
            reply(
                &server,
                &again,
                json!({"tools": [
                    {"name": "list_log_groups", "inputSchema": {}},
                    {"name": "get_alarms", "inputSchema": {}}
                ]}),
            );
            server
        });

        client.connect().await.unwrap();
        assert_eq!(client.refresh_tools().await.unwrap().len(), 1);
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1].name, "get_alarms");
        let _server = serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let (client, _server) = client_with_server(Duration::from_secs(1));
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, McpOperationError::SessionError { .. }));
    }
}
