//! Test doubles: a scripted in-memory connector and a minimal SSE server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::config::ServerConfig;
use super::errors::McpError;
use super::transport::{Connector, Transport};
use super::types::{error_codes, JsonRpcError, JsonRpcResponse, McpToolDefinition};

/// Build a tool definition.
pub(crate) fn tool(name: &str, schema: Value) -> McpToolDefinition {
    McpToolDefinition {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: schema,
    }
}

// ─── Scripted connector ──────────────────────────────────────────────────────

/// How a scripted server behaves. Flags are shared so tests can flip them
/// while a session is live.
#[derive(Clone, Default)]
pub(crate) struct MockBehavior {
    pub tools: Vec<McpToolDefinition>,
    /// Tools per `tools/list` page; all at once when `None`.
    pub page_size: Option<usize>,
    pub refuse_connect: Arc<AtomicBool>,
    pub drop_calls: Arc<AtomicBool>,
    pub hang_calls: Arc<AtomicBool>,
    /// Never answer `initialize`.
    pub hang_connect: Arc<AtomicBool>,
    pub fail_close: bool,
    pub opens: Arc<AtomicU32>,
    pub closes: Arc<AtomicU32>,
    pub calls: Arc<AtomicU32>,
}

impl MockBehavior {
    pub fn with_tools(tools: Vec<McpToolDefinition>) -> Self {
        Self {
            tools,
            ..Self::default()
        }
    }

    pub fn refusing() -> Self {
        let behavior = Self::default();
        behavior.refuse_connect.store(true, Ordering::SeqCst);
        behavior
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    behaviors: HashMap<String, MockBehavior>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, name: &str, behavior: MockBehavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError> {
        let behavior = self
            .behaviors
            .get(config.name())
            .cloned()
            .ok_or_else(|| McpError::Transport {
                server: config.name().to_string(),
                reason: "no such host".into(),
            })?;
        behavior.opens.fetch_add(1, Ordering::SeqCst);

        if behavior.refuse_connect.load(Ordering::SeqCst) {
            return Err(McpError::Transport {
                server: config.name().to_string(),
                reason: "connection refused".into(),
            });
        }

        Ok(Box::new(MockTransport {
            server_name: config.name().to_string(),
            behavior,
        }))
    }
}

struct MockTransport {
    server_name: String,
    behavior: MockBehavior,
}

impl MockTransport {
    fn ok(result: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            id: Some(0),
            method: None,
            result: Some(result),
            error: None,
        }
    }

    fn list_tools(&self, params: Option<Value>) -> JsonRpcResponse {
        let start = params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let all = &self.behavior.tools;
        let end = match self.behavior.page_size {
            Some(size) => (start + size).min(all.len()),
            None => all.len(),
        };
        let page = all.get(start..end).unwrap_or_default();
        let mut result = json!({ "tools": page });
        if end < all.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        Self::ok(result)
    }

    fn call_tool(&self, params: Option<Value>) -> JsonRpcResponse {
        let params = params.unwrap_or(Value::Null);
        let name = params["name"].as_str().unwrap_or_default();
        let args = &params["arguments"];
        match name {
            "echo" => Self::ok(json!({
                "content": [{"type": "text", "text": args["text"].as_str().unwrap_or_default()}]
            })),
            "add" => {
                let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                Self::ok(json!({"content": [{"type": "text", "text": sum.to_string()}]}))
            }
            "snapshot" => Self::ok(json!({
                "content": [
                    {"type": "text", "text": "captured"},
                    {"type": "image", "data": "AQID", "mimeType": "image/png"}
                ]
            })),
            "noop" => Self::ok(json!({"content": []})),
            "explode" => Self::ok(json!({
                "content": [{"type": "text", "text": "division by zero"}],
                "isError": true
            })),
            _ => JsonRpcResponse {
                id: Some(0),
                method: None,
                result: None,
                error: Some(JsonRpcError {
                    code: error_codes::INVALID_PARAMS,
                    message: format!("Unknown tool: {name}"),
                    data: None,
                }),
            },
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        match method {
            "initialize" => {
                if self.behavior.hang_connect.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(Self::ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": self.server_name, "version": "1.0.0"}
                })))
            }
            "tools/list" => Ok(self.list_tools(params)),
            "tools/call" => {
                self.behavior.calls.fetch_add(1, Ordering::SeqCst);
                if self.behavior.hang_calls.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                if self.behavior.drop_calls.load(Ordering::SeqCst) {
                    return Err(McpError::Transport {
                        server: self.server_name.clone(),
                        reason: "broken pipe".into(),
                    });
                }
                Ok(self.call_tool(params))
            }
            other => Err(McpError::Transport {
                server: self.server_name.clone(),
                reason: format!("unexpected method {other}"),
            }),
        }
    }

    async fn notify(&mut self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.behavior.closes.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_close {
            return Err(McpError::Transport {
                server: self.server_name.clone(),
                reason: "close failed".into(),
            });
        }
        Ok(())
    }
}

// ─── Minimal SSE server ──────────────────────────────────────────────────────

/// A loopback MCP server speaking the SSE transport, exposing one `echo` tool.
pub(crate) struct SseTestServer {
    url: Url,
}

type EventSender = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

impl SseTestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sender: EventSender = Arc::new(Mutex::new(None));

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, Arc::clone(&sender)));
            }
        });

        Self {
            url: Url::parse(&format!("http://127.0.0.1:{port}/sse")).unwrap(),
        }
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }
}

async fn serve_connection(stream: TcpStream, sender: EventSender) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((key, value)) = header.split_once(':') {
                if key.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }

        if request_line.starts_with("GET") {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Ok(mut slot) = sender.lock() {
                *slot = Some(tx);
            }
            stream_events(reader.into_inner(), rx).await;
            return;
        }

        if let Ok(message) = serde_json::from_slice::<Value>(&body) {
            if let Some(reply) = respond(&message) {
                let event = format!("event: message\ndata: {reply}\n\n");
                if let Ok(slot) = sender.lock() {
                    if let Some(tx) = slot.as_ref() {
                        let _ = tx.send(event);
                    }
                }
            }
        }

        let accepted = "HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n";
        if reader.get_mut().write_all(accepted.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn stream_events(mut stream: TcpStream, mut rx: mpsc::UnboundedReceiver<String>) {
    let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n";
    let endpoint = ": welcome\n\nevent: endpoint\ndata: /messages/?session_id=test\n\n";
    if stream.write_all(head.as_bytes()).await.is_err()
        || stream.write_all(endpoint.as_bytes()).await.is_err()
    {
        return;
    }
    while let Some(event) = rx.recv().await {
        if stream.write_all(event.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// JSON-RPC reply for one inbound message; `None` for notifications.
fn respond(message: &Value) -> Option<Value> {
    let id = message.get("id")?.clone();
    let method = message["method"].as_str().unwrap_or_default();
    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "sse-test", "version": "0.1.0"}
        }),
        "tools/list" => json!({
            "tools": [{
                "name": "echo",
                "description": "Echo text back",
                "inputSchema": {
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }
            }]
        }),
        "tools/call" => json!({
            "content": [{
                "type": "text",
                "text": message["params"]["arguments"]["text"].as_str().unwrap_or_default()
            }]
        }),
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": error_codes::METHOD_NOT_FOUND, "message": "Method not found"}
            }))
        }
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}
