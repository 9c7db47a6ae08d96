//! MCP Client: tool servers over stdio or SSE, aggregated behind one namespace.
//!
//! This module handles:
//! - Validated server configuration, loaded from JSON or YAML
//! - JSON-RPC 2.0 over a child process's stdio or an SSE stream
//! - Per-server sessions (handshake, tool discovery, tool calls)
//! - Translating tool input schemas into parameter descriptors
//! - Routing `server__tool` calls with lazy reconnection

pub mod config;
pub mod errors;
pub mod manager;
pub mod registry;
pub mod schema;
pub mod session;
pub mod sse;
pub mod stdio;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::{load_server_configs, parse_server_configs, ServerConfig, TransportKind, TransportSpec};
pub use errors::McpError;
pub use manager::ToolManager;
pub use registry::{qualify, split_qualified_name, ToolDescriptor, ToolRegistry};
pub use schema::{translate_schema, ParameterDescriptor, ParameterKind};
pub use session::{ServerStatus, Session, SessionState};
pub use transport::{Connector, DefaultConnector, Transport};
pub use types::{ContentValue, McpToolDefinition, NormalizedResult};
