//! Tool manager: many sessions behind one qualified namespace.
//!
//! The manager owns one [`Session`] per enabled server, flattens their
//! catalogs into a [`ToolRegistry`], and routes `server__tool` calls to the
//! owning session, reconnecting it once on demand.
//!
//! `connect_all` and `disconnect_all` take the state lock exclusively;
//! lookups and calls share it. Calls to the same server are serialized by
//! that session's mutex; calls to different servers run concurrently.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};

use super::config::{ensure_unique_names, load_server_configs, ServerConfig};
use super::errors::McpError;
use super::registry::{split_qualified_name, ToolDescriptor, ToolRegistry};
use super::session::{ServerStatus, Session, SessionState};
use super::transport::{Connector, DefaultConnector};
use super::types::NormalizedResult;

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ManagerState {
    /// Connected-at-startup sessions, in declaration order.
    sessions: Vec<(String, Mutex<Session>)>,
    registry: ToolRegistry,
    initialized: bool,
}

impl ManagerState {
    fn session(&self, server: &str) -> Option<&Mutex<Session>> {
        self.sessions
            .iter()
            .find(|(name, _)| name == server)
            .map(|(_, session)| session)
    }
}

// ─── ToolManager ─────────────────────────────────────────────────────────────

pub struct ToolManager {
    /// Enabled configs only.
    configs: Vec<ServerConfig>,
    connector: Arc<dyn Connector>,
    state: RwLock<ManagerState>,
}

impl ToolManager {
    /// Manager over the enabled entries of `configs`, using the default
    /// transports. Fails on duplicate server names.
    pub fn new(configs: Vec<ServerConfig>) -> Result<Self, McpError> {
        Self::with_connector(configs, Arc::new(DefaultConnector::new()))
    }

    pub fn with_connector(
        configs: Vec<ServerConfig>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, McpError> {
        ensure_unique_names(&configs)?;
        let total = configs.len();
        let configs: Vec<ServerConfig> = configs.into_iter().filter(ServerConfig::enabled).collect();
        if configs.len() < total {
            tracing::debug!(skipped = total - configs.len(), "ignoring disabled servers");
        }
        Ok(Self {
            configs,
            connector,
            state: RwLock::new(ManagerState::default()),
        })
    }

    /// Load a JSON or YAML server list and build a manager from it.
    pub fn from_config_file(path: &Path) -> Result<Self, McpError> {
        Self::new(load_server_configs(path)?)
    }

    pub fn configs(&self) -> &[ServerConfig] {
        &self.configs
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every enabled server in declaration order and rebuild the
    /// registry. A server that fails is logged and left out; it never stops
    /// the others. No-op when already initialized.
    pub async fn connect_all(&self) {
        let mut state = self.state.write().await;
        if state.initialized {
            tracing::warn!("connect_all called on an initialized manager; ignoring");
            return;
        }

        let mut sessions = Vec::with_capacity(self.configs.len());
        let mut registry = ToolRegistry::new();
        let mut failed = 0usize;

        for config in &self.configs {
            let mut session = Session::with_connector(config.clone(), Arc::clone(&self.connector));
            match session.connect().await {
                Ok(()) => {
                    if let Ok(tools) = session.list_tools() {
                        registry.register_server_tools(config.name(), tools);
                    }
                    sessions.push((config.name().to_string(), Mutex::new(session)));
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        server = %config.name(),
                        error = %e,
                        "server unavailable, continuing without it"
                    );
                }
            }
        }

        tracing::info!(
            connected = sessions.len(),
            failed,
            tools = registry.len(),
            "tool manager initialized"
        );

        state.sessions = sessions;
        state.registry = registry;
        state.initialized = true;
    }

    /// Disconnect every session and reset to the uninitialized state.
    /// Teardown problems are logged per session. Safe to repeat.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.write().await;
        if !state.initialized && state.sessions.is_empty() {
            tracing::debug!("disconnect_all on an uninitialized manager; nothing to do");
            return;
        }

        let count = state.sessions.len();
        for (_, session) in state.sessions.drain(..) {
            session.into_inner().disconnect().await;
        }
        state.registry = ToolRegistry::new();
        state.initialized = false;

        tracing::info!(servers = count, "all servers disconnected");
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// The aggregated registry, in declaration then catalog order.
    pub async fn get_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let state = self.state.read().await;
        if !state.initialized {
            return Err(McpError::NotInitialized);
        }
        Ok(state.registry.tools().to_vec())
    }

    /// Registry entries for one server.
    pub async fn get_tools_by_server(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let state = self.state.read().await;
        if !state.initialized {
            return Err(McpError::NotInitialized);
        }
        if state.session(server).is_none() {
            return Err(McpError::ServerNotFound {
                server: server.to_string(),
            });
        }
        Ok(state.registry.tools_for_server(server))
    }

    /// Route a `server__tool` call.
    ///
    /// A session that is not connected gets exactly one reconnection attempt
    /// first; if that fails the call is not attempted and
    /// [`McpError::ServerUnavailable`] is returned. The registry is not
    /// rebuilt after a reconnect.
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<NormalizedResult, McpError> {
        let (server, tool) = split_qualified_name(qualified_name)?;

        let state = self.state.read().await;
        let slot = state.session(server).ok_or_else(|| McpError::ServerNotFound {
            server: server.to_string(),
        })?;
        let mut session = slot.lock().await;

        if !session.is_connected() {
            tracing::info!(server, "session not connected, reconnecting");
            if let Err(e) = session.connect().await {
                tracing::warn!(server, error = %e, "reconnect failed");
                return Err(McpError::ServerUnavailable {
                    server: server.to_string(),
                    source: Box::new(e),
                });
            }
            tracing::info!(server, "reconnected");
        }

        session.call_tool(tool, arguments).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    /// Names of sessions currently connected, in declaration order.
    pub async fn connected_servers(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names = Vec::new();
        for (name, session) in &state.sessions {
            if session.lock().await.is_connected() {
                names.push(name.clone());
            }
        }
        names
    }

    /// One entry per enabled server, including those that failed to connect.
    pub async fn server_status(&self) -> Vec<ServerStatus> {
        let state = self.state.read().await;
        let mut statuses = Vec::with_capacity(self.configs.len());
        for config in &self.configs {
            let status = match state.session(config.name()) {
                Some(session) => session.lock().await.status(),
                None => ServerStatus {
                    name: config.name().to_string(),
                    transport: config.transport_kind(),
                    state: SessionState::Disconnected,
                    tool_count: 0,
                    connected_at: None,
                    connect_count: 0,
                },
            };
            statuses.push(status);
        }
        statuses
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::mcp_client::schema::ParameterKind;
    use crate::mcp_client::testing::{tool, MockBehavior, MockConnector, SseTestServer};
    use crate::mcp_client::types::ContentValue;
    use serde_json::json;

    fn pipe(name: &str) -> ServerConfig {
        ServerConfig::pipe(name, "mock-server").unwrap()
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn text(value: &str) -> NormalizedResult {
        NormalizedResult::Single(ContentValue::Text { text: value.into() })
    }

    fn echo_behavior() -> MockBehavior {
        MockBehavior::with_tools(vec![tool(
            "echo",
            json!({"properties": {"text": {"type": "string"}}, "required": ["text"]}),
        )])
    }

    async fn qualified_names(manager: &ToolManager) -> Vec<String> {
        manager
            .get_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.qualified_name)
            .collect()
    }

    /// alpha and gamma connect, broken refuses.
    fn three_servers() -> (ToolManager, MockBehavior, MockBehavior, MockBehavior) {
        let alpha = MockBehavior::with_tools(vec![
            tool("echo", json!({"properties": {"text": {"type": "string"}}})),
            tool("add", json!({})),
        ]);
        let broken = MockBehavior::refusing();
        let gamma = MockBehavior::with_tools(vec![tool("echo", json!({}))]);
        let connector = MockConnector::new()
            .with_server("alpha", alpha.clone())
            .with_server("broken", broken.clone())
            .with_server("gamma", gamma.clone());
        let manager = ToolManager::with_connector(
            vec![pipe("alpha"), pipe("broken"), pipe("gamma")],
            Arc::new(connector),
        )
        .unwrap();
        (manager, alpha, broken, gamma)
    }

    #[tokio::test]
    async fn test_connect_all_isolates_failures_and_keeps_order() {
        let (manager, _, broken, _) = three_servers();

        manager.connect_all().await;

        assert!(manager.is_initialized().await);
        assert_eq!(
            qualified_names(&manager).await,
            vec!["alpha__echo", "alpha__add", "gamma__echo"]
        );
        assert_eq!(manager.connected_servers().await, vec!["alpha", "gamma"]);
        assert_eq!(broken.opens(), 1);
    }

    #[tokio::test]
    async fn test_connect_all_with_no_reachable_servers() {
        let connector = MockConnector::new().with_server("down", MockBehavior::refusing());
        let manager = ToolManager::with_connector(vec![pipe("down")], Arc::new(connector)).unwrap();

        manager.connect_all().await;

        assert!(manager.is_initialized().await);
        assert!(manager.get_tools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_servers_are_never_opened() {
        let off = echo_behavior();
        let connector = MockConnector::new()
            .with_server("on", echo_behavior())
            .with_server("off", off.clone());
        let manager = ToolManager::with_connector(
            vec![pipe("on"), pipe("off").with_enabled(false)],
            Arc::new(connector),
        )
        .unwrap();

        manager.connect_all().await;

        assert_eq!(manager.configs().len(), 1);
        assert_eq!(off.opens(), 0);
        assert_eq!(qualified_names(&manager).await, vec!["on__echo"]);
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let result = ToolManager::with_connector(
            vec![pipe("calc"), pipe("calc")],
            Arc::new(MockConnector::new()),
        );
        assert!(matches!(result, Err(McpError::Config { .. })));
    }

    #[tokio::test]
    async fn test_get_tools_before_connect_all() {
        let (manager, ..) = three_servers();
        assert!(matches!(manager.get_tools().await, Err(McpError::NotInitialized)));
        assert!(matches!(
            manager.get_tools_by_server("alpha").await,
            Err(McpError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_second_connect_all_is_a_no_op() {
        let (manager, alpha, ..) = three_servers();

        manager.connect_all().await;
        manager.connect_all().await;

        assert_eq!(alpha.opens(), 1);
        assert_eq!(manager.get_tools().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_call_routes_by_qualified_name() {
        let (manager, alpha, _, gamma) = three_servers();
        manager.connect_all().await;

        let result = manager
            .call_tool("alpha__echo", args(json!({"text": "hello"})))
            .await
            .unwrap();

        assert_eq!(result, text("hello"));
        assert_eq!(alpha.calls(), 1);
        assert_eq!(gamma.calls(), 0);
    }

    #[tokio::test]
    async fn test_call_with_malformed_name() {
        let (manager, ..) = three_servers();
        manager.connect_all().await;

        let err = manager.call_tool("alpha.echo", Map::new()).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn test_call_unknown_server_leaves_state_untouched() {
        let (manager, ..) = three_servers();
        manager.connect_all().await;
        let before = manager.get_tools().await.unwrap();

        let err = manager.call_tool("unknown__x", Map::new()).await.unwrap_err();

        assert!(matches!(err, McpError::ServerNotFound { ref server } if server == "unknown"));
        assert_eq!(manager.get_tools().await.unwrap(), before);
        assert_eq!(manager.connected_servers().await, vec!["alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_servers_that_failed_at_startup_are_absent() {
        let (manager, _, broken, _) = three_servers();
        manager.connect_all().await;

        let err = manager.call_tool("broken__echo", Map::new()).await.unwrap_err();

        assert!(matches!(err, McpError::ServerNotFound { .. }));
        assert_eq!(broken.opens(), 1);
        assert!(matches!(
            manager.get_tools_by_server("broken").await,
            Err(McpError::ServerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_session_reconnects_once_and_succeeds() {
        let (manager, alpha, ..) = three_servers();
        manager.connect_all().await;

        alpha.drop_calls.store(true, Ordering::SeqCst);
        let err = manager
            .call_tool("alpha__echo", args(json!({"text": "lost"})))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(manager.connected_servers().await, vec!["gamma"]);

        alpha.drop_calls.store(false, Ordering::SeqCst);
        let result = manager
            .call_tool("alpha__echo", args(json!({"text": "back"})))
            .await
            .unwrap();

        assert_eq!(result, text("back"));
        assert_eq!(alpha.opens(), 2);
        assert_eq!(manager.connected_servers().await, vec!["alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_server_unavailable() {
        let (manager, alpha, ..) = three_servers();
        manager.connect_all().await;

        alpha.drop_calls.store(true, Ordering::SeqCst);
        let _ = manager.call_tool("alpha__echo", Map::new()).await;
        let calls_before = alpha.calls();
        alpha.refuse_connect.store(true, Ordering::SeqCst);

        let err = manager.call_tool("alpha__echo", Map::new()).await.unwrap_err();

        match err {
            McpError::ServerUnavailable { server, source } => {
                assert_eq!(server, "alpha");
                assert!(matches!(*source, McpError::Connection { .. }));
            }
            other => panic!("expected ServerUnavailable, got {other:?}"),
        }
        // Exactly one reconnect attempt, and no call forwarded.
        assert_eq!(alpha.opens(), 2);
        assert_eq!(alpha.calls(), calls_before);
        // Registry unchanged by reachability.
        assert_eq!(manager.get_tools().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_server() {
        let (manager, alpha, ..) = three_servers();
        manager.connect_all().await;

        let (a, b, c) = tokio::join!(
            manager.call_tool("alpha__echo", args(json!({"text": "a"}))),
            manager.call_tool("alpha__echo", args(json!({"text": "b"}))),
            manager.call_tool("gamma__echo", Map::new()),
        );

        assert_eq!(a.unwrap(), text("a"));
        assert_eq!(b.unwrap(), text("b"));
        assert!(c.is_ok());
        assert_eq!(alpha.calls(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_all_is_idempotent() {
        let (manager, alpha, _, gamma) = three_servers();

        manager.disconnect_all().await;
        manager.connect_all().await;
        manager.disconnect_all().await;
        manager.disconnect_all().await;

        assert!(!manager.is_initialized().await);
        assert!(matches!(manager.get_tools().await, Err(McpError::NotInitialized)));
        assert_eq!(alpha.closes(), 1);
        assert_eq!(gamma.closes(), 1);
        assert!(manager.connected_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect_all() {
        let (manager, alpha, ..) = three_servers();

        manager.connect_all().await;
        manager.disconnect_all().await;
        manager.connect_all().await;

        assert_eq!(alpha.opens(), 2);
        assert_eq!(manager.get_tools().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_server_status_reports_every_enabled_server() {
        let (manager, ..) = three_servers();
        manager.connect_all().await;

        let statuses = manager.server_status().await;

        let summary: Vec<(&str, SessionState, usize)> = statuses
            .iter()
            .map(|s| (s.name.as_str(), s.state, s.tool_count))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("alpha", SessionState::Connected, 2),
                ("broken", SessionState::Disconnected, 0),
                ("gamma", SessionState::Connected, 1),
            ]
        );
        let value = serde_json::to_value(&statuses[0]).unwrap();
        assert_eq!(value["transport"], "pipe");
        assert_eq!(value["state"], "connected");
    }

    #[tokio::test]
    async fn test_get_tools_by_server() {
        let (manager, ..) = three_servers();
        manager.connect_all().await;

        let tools = manager.get_tools_by_server("gamma").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].qualified_name, "gamma__echo");
    }

    #[tokio::test]
    async fn test_stream_server_end_to_end() {
        let server = SseTestServer::start().await;
        let config = ServerConfig::stream("web", server.url().as_str()).unwrap();
        let manager = ToolManager::new(vec![config]).unwrap();

        manager.connect_all().await;
        assert_eq!(qualified_names(&manager).await, vec!["web__echo"]);

        let result = manager
            .call_tool("web__echo", args(json!({"text": "over sse"})))
            .await
            .unwrap();
        assert_eq!(result, text("over sse"));

        manager.disconnect_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_server_end_to_end() {
        let fixture = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/calc_server.sh");
        let config = ServerConfig::pipe("calc", "sh").unwrap().with_args([fixture]);
        let manager = ToolManager::new(vec![config]).unwrap();

        manager.connect_all().await;

        let tools = manager.get_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].qualified_name, "calc__add");
        let params: Vec<(&str, ParameterKind, bool)> = tools[0]
            .parameter_set
            .iter()
            .map(|p| (p.name.as_str(), p.kind, p.required))
            .collect();
        assert_eq!(
            params,
            vec![("a", ParameterKind::Integer, true), ("b", ParameterKind::Integer, true)]
        );

        let result = manager
            .call_tool("calc__add", args(json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(result, text("5"));

        manager.disconnect_all().await;
        assert!(!manager.is_initialized().await);
    }
}
