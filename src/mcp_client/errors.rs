//! MCP Client error types.
//!
//! Every variant carries the server (or tool) it concerns so callers can log
//! without extra context. Structured logging happens at the call sites.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Invalid server configuration record.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// Transport, handshake, or tool listing failed while connecting.
    #[error("failed to connect to server '{server}': {source}")]
    Connection {
        server: String,
        #[source]
        source: Box<McpError>,
    },

    /// Operation requires a session that has connected at least once.
    #[error("server '{server}' is not connected")]
    NotConnected { server: String },

    /// `connect_all` has not been called yet.
    #[error("tool manager not initialized; call connect_all() first")]
    NotInitialized,

    /// Qualified tool name lacks the `server__tool` separator.
    #[error("tool name must have the form 'server__tool': '{name}'")]
    InvalidName { name: String },

    /// Qualified tool name references a server the manager does not hold.
    #[error("server '{server}' not found")]
    ServerNotFound { server: String },

    /// Lazy reconnection before a call failed.
    #[error("server '{server}' unavailable: {source}")]
    ServerUnavailable {
        server: String,
        #[source]
        source: Box<McpError>,
    },

    /// The connection dropped during a call on a previously healthy session.
    #[error("server '{server}' disconnected: {reason}")]
    ServerDisconnected { server: String, reason: String },

    /// I/O or framing error on the underlying channel.
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// The server sent a payload that does not match the protocol.
    #[error("protocol error for server '{server}': {reason}")]
    Protocol { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// An operation exceeded the server's configured timeout.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Tool call arguments do not match the tool's parameters.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool ran but reported failure (`isError` result).
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },
}

impl McpError {
    /// Whether this error means the session lost its connection mid-call.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, McpError::ServerDisconnected { .. })
    }

    /// The server this error concerns, when it names one.
    pub fn server(&self) -> Option<&str> {
        match self {
            McpError::Connection { server, .. }
            | McpError::NotConnected { server }
            | McpError::ServerNotFound { server }
            | McpError::ServerUnavailable { server, .. }
            | McpError::ServerDisconnected { server, .. }
            | McpError::Transport { server, .. }
            | McpError::Protocol { server, .. }
            | McpError::Timeout { server, .. } => Some(server),
            _ => None,
        }
    }
}
