//! JSON-RPC over stdio: the pipe transport.
//!
//! Spawns the server as a child process and talks line-delimited JSON over
//! its stdin/stdout (one JSON object per line). Stderr is drained in the
//! background so a chatty server can never block on a full pipe; the tail is
//! kept for diagnostics when the handshake fails.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::config::{ServerConfig, TransportSpec};
use super::errors::McpError;
use super::transport::{next_request_id, Transport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful exit after stdin is closed, before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Upper bound on the diagnostic text attached to errors.
const STDERR_MAX_CHARS: usize = 2000;

// ─── StdioTransport ──────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    process: Child,
    /// `None` once stdin has been closed during shutdown.
    writer: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// Spawn the server process described by `config` and attach to its pipes.
    pub fn spawn(config: &ServerConfig) -> Result<Self, McpError> {
        let name = config.name();
        let TransportSpec::Pipe {
            command,
            args,
            env,
            cwd,
        } = config.transport()
        else {
            return Err(McpError::Config {
                reason: format!("server '{name}' is not a pipe server"),
            });
        };

        let mut cmd = Command::new(command);
        cmd.args(args);
        // Inherit the parent environment, then layer the configured vars.
        cmd.envs(env);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::Transport {
            server: name.to_string(),
            reason: format!("failed to spawn '{command}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Transport {
            server: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Transport {
            server: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail));
        }

        tracing::debug!(server = name, command = %command, pid = ?child.id(), "spawned server process");

        Ok(Self {
            server_name: name.to_string(),
            process: child,
            writer: Some(stdin),
            reader: BufReader::new(stdout),
            stderr_tail,
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason,
        }
    }

    /// Write one JSON line to the child's stdin.
    async fn write_line(&mut self, json: String) -> Result<(), McpError> {
        let mut line = json;
        line.push('\n');

        let Some(writer) = self.writer.as_mut() else {
            return Err(self.transport_error("stdin already closed".into()));
        };

        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;
        self.write_line(json).await?;

        // Read response lines until we find one with matching id
        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(
                    self.transport_error("server stdout closed (process may have exited)".into())
                );
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.answers(id) => return Ok(resp),
                Ok(other) => {
                    tracing::trace!(
                        server = %self.server_name,
                        method = ?other.method,
                        "skipping unrelated message"
                    );
                }
                Err(_) => {
                    // Not JSON-RPC: probably log output on stdout.
                    tracing::trace!(server = %self.server_name, line = trimmed, "skipping non-JSON line");
                }
            }
        }
    }

    async fn notify(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification).map_err(|e| {
            self.transport_error(format!("failed to serialize notification: {e}"))
        })?;
        self.write_line(json).await
    }

    async fn close(&mut self) -> Result<(), McpError> {
        // Closing stdin is the shutdown signal for stdio servers.
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, %status, "server process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(self.transport_error(format!("failed to wait for exit: {e}"))),
            Err(_) => {
                tracing::debug!(
                    server = %self.server_name,
                    "server did not exit after stdin closed, killing"
                );
                self.process
                    .kill()
                    .await
                    .map_err(|e| self.transport_error(format!("failed to kill process: {e}")))
            }
        }
    }

    async fn abort(&mut self) -> Result<(), McpError> {
        self.writer = None;
        self.process
            .kill()
            .await
            .map_err(|e| self.transport_error(format!("failed to kill process: {e}")))
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().ok()?;
        if tail.is_empty() {
            return None;
        }
        let mut text = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        if text.len() > STDERR_MAX_CHARS {
            let mut cut = STDERR_MAX_CHARS;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...(truncated)");
        }
        Some(text)
    }
}

/// Forward the child's stderr to the log and keep a bounded tail.
fn drain_stderr(server: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, stderr = %line, "server stderr");
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ServerConfig {
        ServerConfig::pipe(name, "sh")
            .unwrap()
            .with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_request_skips_noise_and_matches_id() {
        // Echo back a response carrying whatever id the request used, after
        // some log noise on stdout.
        let script = r#"read line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
echo "starting up..."
echo '{"jsonrpc":"2.0","method":"notifications/message","params":{}}'
printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
"#;
        let mut transport = StdioTransport::spawn(&sh("echo", script)).unwrap();
        let resp = transport.request("ping", None).await.unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_fails_when_stdout_closes() {
        let mut transport = StdioTransport::spawn(&sh("mute", "exit 0")).unwrap();
        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_diagnostics_capture_stderr() {
        let mut transport =
            StdioTransport::spawn(&sh("noisy", "echo 'fatal: missing API key' >&2; exit 1")).unwrap();
        let _ = transport.request("initialize", None).await;
        // Give the drain task a moment to collect the line.
        for _ in 0..50 {
            if transport.diagnostics().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let diag = transport.diagnostics().unwrap();
        assert!(diag.contains("missing API key"));
    }

    #[tokio::test]
    async fn test_close_kills_unresponsive_child() {
        // Ignores stdin EOF and keeps running.
        let mut transport = StdioTransport::spawn(&sh("stubborn", "trap '' TERM; sleep 30")).unwrap();
        let start = std::time::Instant::now();
        transport.close().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_abort_kills_without_grace_period() {
        let mut transport = StdioTransport::spawn(&sh("sleeper", "sleep 30")).unwrap();
        let start = std::time::Instant::now();
        transport.abort().await.unwrap();
        assert!(start.elapsed() < SHUTDOWN_TIMEOUT);
    }

    #[tokio::test]
    async fn test_spawn_rejects_stream_config() {
        let config = ServerConfig::stream("web", "http://localhost/sse").unwrap();
        assert!(matches!(
            StdioTransport::spawn(&config),
            Err(McpError::Config { .. })
        ));
    }
}
