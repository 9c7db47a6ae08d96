//! Transport seam shared by the pipe and stream channels.
//!
//! A [`Transport`] moves JSON-RPC messages over one open channel. A
//! [`Connector`] opens transports from a [`ServerConfig`]; sessions hold one
//! so that tests can swap in scripted channels.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::config::{ServerConfig, TransportSpec};
use super::errors::McpError;
use super::types::{error_codes, JsonRpcResponse};
use super::{sse, stdio};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// One open JSON-RPC channel to a tool server.
#[async_trait]
pub trait Transport: Send {
    /// Send a request and wait for the response with the matching id.
    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError>;

    /// Release the channel. Called at most once.
    async fn close(&mut self) -> Result<(), McpError>;

    /// Release the channel without a grace period, after a failed connect.
    /// Called instead of `close`, at most once.
    async fn abort(&mut self) -> Result<(), McpError> {
        self.close().await
    }

    /// Recent out-of-band output (e.g. process stderr) worth attaching to
    /// connection errors.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Opens transports for server configurations.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError>;
}

/// Opens the transport named by each config: a child process for pipe
/// servers, an SSE stream for stream servers.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured HTTP client for stream servers (proxies, TLS roots).
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError> {
        match config.transport() {
            TransportSpec::Pipe { .. } => {
                let transport = stdio::StdioTransport::spawn(config)?;
                Ok(Box::new(transport))
            }
            TransportSpec::Stream { url } => {
                let transport =
                    sse::SseTransport::open(config.name(), self.http.clone(), url.clone()).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
