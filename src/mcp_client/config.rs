//! Server configuration loading and validation.
//!
//! A [`ServerConfig`] is validated when it is built, whether through the
//! constructors or through serde, so an invalid record never reaches
//! connect time. Config files may be JSON or YAML and have `${VAR}` /
//! `${VAR:-default}` references in string values resolved from the environment.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default connect/call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Separator between server name and tool name in qualified names.
pub const NAME_SEPARATOR: &str = "__";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which channel a server is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Long-lived server-sent-events stream to a network endpoint.
    #[serde(alias = "sse")]
    Stream,
    /// Child process spoken to over stdin/stdout.
    #[serde(alias = "stdio")]
    Pipe,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("stream"),
            TransportKind::Pipe => f.write_str("pipe"),
        }
    }
}

/// Transport-specific connection data.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSpec {
    Stream {
        url: Url,
    },
    Pipe {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        /// Working directory for the child process.
        cwd: Option<PathBuf>,
    },
}

/// Validated description of one tool server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    name: String,
    transport: TransportSpec,
    timeout: Duration,
    enabled: bool,
}

impl ServerConfig {
    /// A server reached over the stream transport.
    pub fn stream(name: &str, url: &str) -> Result<Self, McpError> {
        validate_name(name)?;
        let url = parse_url(name, url)?;
        Ok(Self {
            name: name.to_string(),
            transport: TransportSpec::Stream { url },
            timeout: DEFAULT_TIMEOUT,
            enabled: true,
        })
    }

    /// A server spawned as a child process.
    pub fn pipe(name: &str, command: &str) -> Result<Self, McpError> {
        validate_name(name)?;
        if command.trim().is_empty() {
            return Err(McpError::Config {
                reason: format!("server '{name}': pipe transport requires 'command'"),
            });
        }
        Ok(Self {
            name: name.to_string(),
            transport: TransportSpec::Pipe {
                command: command.to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
            },
            timeout: DEFAULT_TIMEOUT,
            enabled: true,
        })
    }

    /// Set process arguments. Ignored for stream servers.
    pub fn with_args<I, S>(mut self, new_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let TransportSpec::Pipe { ref mut args, .. } = self.transport {
            *args = new_args.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Set extra environment variables. Ignored for stream servers.
    pub fn with_env(mut self, vars: HashMap<String, String>) -> Self {
        if let TransportSpec::Pipe { ref mut env, .. } = self.transport {
            *env = vars;
        }
        self
    }

    /// Set the child's working directory. Ignored for stream servers.
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        if let TransportSpec::Pipe { ref mut cwd, .. } = self.transport {
            *cwd = Some(dir.into());
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &TransportSpec {
        &self.transport
    }

    pub fn transport_kind(&self) -> TransportKind {
        match self.transport {
            TransportSpec::Stream { .. } => TransportKind::Stream,
            TransportSpec::Pipe { .. } => TransportKind::Pipe,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

// ─── Raw Record ──────────────────────────────────────────────────────────────

/// The on-disk record, before validation.
#[derive(Debug, Deserialize)]
struct RawServerConfig {
    name: String,
    transport: TransportKind,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    /// Seconds.
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = McpError;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        let config = match raw.transport {
            TransportKind::Stream => {
                let url = raw.url.filter(|u| !u.trim().is_empty()).ok_or_else(|| {
                    McpError::Config {
                        reason: format!("server '{}': stream transport requires 'url'", raw.name),
                    }
                })?;
                ServerConfig::stream(&raw.name, &url)?
            }
            TransportKind::Pipe => {
                let command = raw.command.unwrap_or_default();
                let mut config = ServerConfig::pipe(&raw.name, &command)?
                    .with_args(raw.args)
                    .with_env(raw.env.unwrap_or_default());
                if let Some(cwd) = raw.cwd {
                    config = config.with_cwd(cwd);
                }
                config
            }
        };

        let timeout = match raw.timeout {
            Some(secs) => parse_timeout(&raw.name, secs)?,
            None => DEFAULT_TIMEOUT,
        };

        Ok(config.with_timeout(timeout).with_enabled(raw.enabled))
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

fn validate_name(name: &str) -> Result<(), McpError> {
    if name.trim().is_empty() {
        return Err(McpError::Config {
            reason: "server name must not be empty".into(),
        });
    }
    if name.contains(NAME_SEPARATOR) {
        return Err(McpError::Config {
            reason: format!("server '{name}': name must not contain '{NAME_SEPARATOR}'"),
        });
    }
    Ok(())
}

fn parse_url(name: &str, url: &str) -> Result<Url, McpError> {
    let parsed = Url::parse(url).map_err(|e| McpError::Config {
        reason: format!("server '{name}': invalid url '{url}': {e}"),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(McpError::Config {
            reason: format!("server '{name}': url must be http(s), got '{url}'"),
        });
    }
    Ok(parsed)
}

fn parse_timeout(name: &str, secs: f64) -> Result<Duration, McpError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(McpError::Config {
            reason: format!("server '{name}': timeout must be a positive number of seconds"),
        });
    }
    Duration::try_from_secs_f64(secs).map_err(|e| McpError::Config {
        reason: format!("server '{name}': invalid timeout {secs}: {e}"),
    })
}

/// Reject configuration sets that reuse a server name.
pub fn ensure_unique_names(configs: &[ServerConfig]) -> Result<(), McpError> {
    let mut seen = HashSet::new();
    for config in configs {
        if !seen.insert(config.name()) {
            return Err(McpError::Config {
                reason: format!("duplicate server name '{}'", config.name()),
            });
        }
    }
    Ok(())
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Build configs from a parsed document: either a bare array of records or
/// `{ "servers": [...] }`.
fn configs_from_value(value: serde_json::Value) -> Result<Vec<ServerConfig>, McpError> {
    let records = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut map) => map.remove("servers").ok_or_else(|| {
            McpError::Config {
                reason: "config object must contain a 'servers' array".into(),
            }
        })?,
        other => {
            return Err(McpError::Config {
                reason: format!("expected an array of servers, got {other}"),
            })
        }
    };

    let configs: Vec<ServerConfig> =
        serde_json::from_value(records).map_err(|e| McpError::Config {
            reason: format!("invalid server record: {e}"),
        })?;
    ensure_unique_names(&configs)?;
    Ok(configs)
}

/// Parse server configurations from a JSON string.
pub fn parse_server_configs(json: &str) -> Result<Vec<ServerConfig>, McpError> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| McpError::Config {
        reason: format!("failed to parse server config: {e}"),
    })?;
    configs_from_value(interpolate_value(value))
}

/// Load server configurations from a JSON or YAML file.
///
/// The format is chosen by extension: `.yaml`/`.yml` are YAML, anything else
/// is JSON.
pub fn load_server_configs(path: &Path) -> Result<Vec<ServerConfig>, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );

    let value: serde_json::Value = if is_yaml {
        serde_yaml::from_str(&raw).map_err(|e| McpError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_json::from_str(&raw).map_err(|e| McpError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    let configs = configs_from_value(interpolate_value(value))?;
    tracing::debug!(
        path = %path.display(),
        servers = configs.len(),
        "loaded server configs"
    );
    Ok(configs)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Interpolate every string leaf of a parsed document. Keys are left as-is,
/// and substituted values are never re-parsed as JSON or YAML.
fn interpolate_value(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(text) => Value::String(interpolate_env_vars(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(interpolate_value).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, field)| (key, interpolate_value(field)))
                .collect(),
        ),
        other => other,
    }
}

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
