//! Transport session: one connection to one tool server.
//!
//! A session opens its channel, performs the MCP handshake, caches the tool
//! catalog, and forwards tool calls. It never reconnects on its own; when a
//! call loses the channel the session drops to `Disconnected` and reports it,
//! and the owner decides whether to call [`Session::connect`] again.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::config::{ServerConfig, TransportKind};
use super::errors::McpError;
use super::transport::{extract_result, Connector, DefaultConnector, Transport};
use super::types::{
    CallToolResult, ContentBlock, ContentValue, InitializeResult, ListToolsResult,
    McpToolDefinition, NormalizedResult, ServerInfo, PROTOCOL_VERSION,
};

/// Client name announced during the handshake.
const CLIENT_NAME: &str = "toolbridge";

// ─── State ───────────────────────────────────────────────────────────────────

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
        }
    }
}

/// Point-in-time summary of a session, for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: SessionState,
    pub tool_count: usize,
    pub connected_at: Option<DateTime<Utc>>,
    pub connect_count: u32,
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct Session {
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    /// Catalog from the last successful connect. Kept across disconnects.
    tools: Option<Vec<McpToolDefinition>>,
    server_info: Option<ServerInfo>,
    connected_at: Option<DateTime<Utc>>,
    connect_count: u32,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.config.name())
            .field("state", &self.state)
            .field("tools", &self.tools.as_ref().map(Vec::len))
            .finish()
    }
}

impl Session {
    /// A disconnected session using the default transports.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_connector(config, Arc::new(DefaultConnector::new()))
    }

    pub fn with_connector(config: ServerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            state: SessionState::Disconnected,
            transport: None,
            tools: None,
            server_info: None,
            connected_at: None,
            connect_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Identity the server reported in its last handshake.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.config.name().to_string(),
            transport: self.config.transport_kind(),
            state: self.state,
            tool_count: self.tools.as_ref().map_or(0, Vec::len),
            connected_at: self.connected_at,
            connect_count: self.connect_count,
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open the channel, handshake, and fetch the tool catalog.
    ///
    /// A connected session is torn down first. The whole sequence is bounded
    /// by the server's timeout; on any failure the session is left
    /// `Disconnected` and the cause is wrapped in [`McpError::Connection`].
    pub async fn connect(&mut self) -> Result<(), McpError> {
        if self.state == SessionState::Connected {
            self.disconnect().await;
        }

        let name = self.config.name().to_string();
        let timeout = self.config.timeout();
        self.state = SessionState::Connecting;
        tracing::info!(
            server = %name,
            transport = %self.config.transport_kind(),
            "connecting to server"
        );

        let mut opened: Option<Box<dyn Transport>> = None;
        let established = tokio::time::timeout(
            timeout,
            establish(&self.config, &*self.connector, &mut opened),
        )
        .await
        .unwrap_or_else(|_| {
            Err(McpError::Timeout {
                server: name.clone(),
                operation: "connect".into(),
                timeout_ms: timeout.as_millis() as u64,
            })
        });

        match established {
            Ok((server_info, tools)) => {
                tracing::debug!(
                    server = %name,
                    tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
                    "discovered tools"
                );
                tracing::info!(server = %name, tool_count = tools.len(), "connected to server");
                self.transport = opened;
                self.tools = Some(tools);
                self.server_info = server_info;
                self.connected_at = Some(Utc::now());
                self.connect_count += 1;
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                let diagnostics = opened.as_ref().and_then(|t| t.diagnostics());
                if let Some(mut transport) = opened {
                    if let Err(close_err) = transport.abort().await {
                        tracing::debug!(server = %name, error = %close_err, "cleanup after failed connect");
                    }
                }
                self.state = SessionState::Disconnected;

                let cause = match diagnostics {
                    Some(stderr) => {
                        tracing::warn!(server = %name, stderr = %stderr, "server stderr captured on failure");
                        with_stderr(e, &stderr)
                    }
                    None => e,
                };
                tracing::warn!(server = %name, error = %cause, "failed to connect to server");
                Err(McpError::Connection {
                    server: name,
                    source: Box::new(cause),
                })
            }
        }
    }

    /// Release the channel. Teardown failures are logged, never returned.
    /// No-op when already disconnected.
    pub async fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        match transport.close().await {
            Ok(()) => tracing::info!(server = %self.config.name(), "disconnected from server"),
            Err(e) => tracing::warn!(
                server = %self.config.name(),
                error = %e,
                "error while closing transport"
            ),
        }
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// The catalog from the last successful connect. No I/O.
    pub fn list_tools(&self) -> Result<&[McpToolDefinition], McpError> {
        self.tools.as_deref().ok_or_else(|| McpError::NotConnected {
            server: self.config.name().to_string(),
        })
    }

    /// Invoke a tool and normalize its content.
    ///
    /// A transport failure or timeout drops the session to `Disconnected`
    /// and returns [`McpError::ServerDisconnected`]. JSON-RPC errors and
    /// `isError` results leave the session connected.
    pub async fn call_tool(
        &mut self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<NormalizedResult, McpError> {
        let server = self.config.name().to_string();
        let timeout = self.config.timeout();
        let transport = match self.transport.as_mut() {
            Some(transport) if self.state == SessionState::Connected => transport,
            _ => return Err(McpError::NotConnected { server }),
        };

        let start = Instant::now();
        tracing::debug!(server = %server, tool, "calling tool");

        let params = json!({ "name": tool, "arguments": arguments });
        let outcome = tokio::time::timeout(timeout, transport.request("tools/call", Some(params))).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.connection_lost(e.to_string())),
            Err(_) => {
                return Err(self.connection_lost(format!(
                    "tools/call timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let result = extract_result(response).inspect_err(|e| {
            tracing::warn!(server = %server, tool, elapsed_ms, error = %e, "tool call returned an error");
        })?;
        let result: CallToolResult = serde_json::from_value(result).map_err(|e| McpError::Protocol {
            server: server.clone(),
            reason: format!("failed to parse tools/call result: {e}"),
        })?;

        if result.is_error {
            let message = error_text(&result.content);
            tracing::warn!(server = %server, tool, elapsed_ms, error = %message, "tool reported failure");
            return Err(McpError::ToolFailed {
                tool: tool.to_string(),
                message,
            });
        }

        let normalized = normalize(&server, result.content)?;
        tracing::debug!(server = %server, tool, elapsed_ms, "tool call completed");
        Ok(normalized)
    }

    /// Mark the channel lost. Dropping the transport kills a pipe server's
    /// process and closes a stream server's connection.
    fn connection_lost(&mut self, reason: String) -> McpError {
        let server = self.config.name().to_string();
        tracing::warn!(server = %server, reason = %reason, "connection lost");
        self.state = SessionState::Disconnected;
        self.transport = None;
        McpError::ServerDisconnected { server, reason }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Open a transport into `slot` and run `initialize` → `initialized` →
/// `tools/list`. The transport stays in `slot` on failure so the caller can
/// read diagnostics and close it.
async fn establish(
    config: &ServerConfig,
    connector: &dyn Connector,
    slot: &mut Option<Box<dyn Transport>>,
) -> Result<(Option<ServerInfo>, Vec<McpToolDefinition>), McpError> {
    let server = config.name();
    let transport = slot.insert(connector.open(config).await?);

    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let result = extract_result(transport.request("initialize", Some(params)).await?)?;
    let init: InitializeResult = serde_json::from_value(result).map_err(|e| McpError::Protocol {
        server: server.to_string(),
        reason: format!("failed to parse initialize response: {e}"),
    })?;
    if let Some(version) = init.protocol_version.as_deref() {
        if version != PROTOCOL_VERSION {
            tracing::debug!(server, version, "server negotiated a different protocol version");
        }
    }

    transport.notify("notifications/initialized", None).await?;

    let tools = list_all_tools(&mut **transport, server).await?;
    Ok((init.server_info, tools))
}

/// Fetch every page of `tools/list`.
async fn list_all_tools(
    transport: &mut dyn Transport,
    server: &str,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let result = extract_result(transport.request("tools/list", params).await?)?;
        let page: ListToolsResult = serde_json::from_value(result).map_err(|e| McpError::Protocol {
            server: server.to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next);
            }
            _ => return Ok(tools),
        }
    }
}

/// Fold captured stderr into channel-level errors.
fn with_stderr(error: McpError, stderr: &str) -> McpError {
    let suffix = format!(" | stderr: {}", stderr.trim());
    match error {
        McpError::Transport { server, reason } => McpError::Transport {
            server,
            reason: reason + &suffix,
        },
        McpError::Protocol { server, reason } => McpError::Protocol {
            server,
            reason: reason + &suffix,
        },
        other => other,
    }
}

// ─── Result Normalization ────────────────────────────────────────────────────

/// Collapse content blocks into one value, a sequence, or the empty marker.
/// Unsupported block kinds are skipped.
fn normalize(server: &str, content: Vec<ContentBlock>) -> Result<NormalizedResult, McpError> {
    let mut values = Vec::with_capacity(content.len());
    for block in content {
        let value = match block {
            ContentBlock::Text { text } => ContentValue::Text { text },
            ContentBlock::Image { data, mime_type } | ContentBlock::Audio { data, mime_type } => {
                ContentValue::Binary {
                    data: decode_base64(server, &data)?,
                    mime_type,
                }
            }
            ContentBlock::Resource { resource } => match (resource.text, resource.blob) {
                (Some(text), _) => ContentValue::Text { text },
                (None, Some(blob)) => ContentValue::Binary {
                    data: decode_base64(server, &blob)?,
                    mime_type: resource.mime_type,
                },
                (None, None) => continue,
            },
            ContentBlock::Unsupported => continue,
        };
        values.push(value);
    }
    Ok(NormalizedResult::from_values(values))
}

fn decode_base64(server: &str, data: &str) -> Result<Vec<u8>, McpError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| McpError::Protocol {
            server: server.to_string(),
            reason: format!("invalid base64 content: {e}"),
        })
}

/// Text of an `isError` result.
fn error_text(content: &[ContentBlock]) -> String {
    let text = content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        "tool reported an error".to_string()
    } else {
        text
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
