//! Toolbridge: connect to many MCP tool servers and call their tools through
//! one `server__tool` namespace.
//!
//! ```no_run
//! use toolbridge::mcp_client::{ServerConfig, ToolManager};
//!
//! # async fn run() -> Result<(), toolbridge::mcp_client::McpError> {
//! let calc = ServerConfig::pipe("calc", "calc-server")?;
//! let manager = ToolManager::new(vec![calc])?;
//! manager.connect_all().await;
//! for tool in manager.get_tools().await? {
//!     println!("{}: {}", tool.qualified_name, tool.description);
//! }
//! manager.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

pub mod mcp_client;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Log file name inside the directory given to [`init_tracing`].
pub const LOG_FILE_NAME: &str = "toolbridge.log";

/// Previous runs' logs kept by [`init_tracing`].
pub const KEPT_LOG_FILES: u32 = 3;

// ─── Log files ───────────────────────────────────────────────────────────────

/// A log file plus its numbered predecessors (`name.1` is the newest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub dir: PathBuf,
    pub file_name: String,
    /// Rotated files kept; `0` truncates on every start.
    pub keep: u32,
}

impl LogFile {
    /// `toolbridge.log` in `dir`, keeping the last three runs.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file_name: LOG_FILE_NAME.to_string(),
            keep: KEPT_LOG_FILES,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_keep(mut self, keep: u32) -> Self {
        self.keep = keep;
        self
    }

    /// Path of the live log.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    fn generation(&self, n: u32) -> PathBuf {
        self.dir.join(format!("{}.{n}", self.file_name))
    }

    /// Shift `name` → `name.1` → … → `name.{keep}`, dropping the oldest.
    /// Gaps in the chain are skipped.
    fn rotate(&self) {
        if self.keep == 0 {
            let _ = fs::remove_file(self.path());
            return;
        }
        let _ = fs::remove_file(self.generation(self.keep));
        for n in (1..self.keep).rev() {
            let _ = fs::rename(self.generation(n), self.generation(n + 1));
        }
        let _ = fs::rename(self.path(), self.generation(1));
    }

    /// Rotate, then open a fresh live log.
    fn open(&self) -> io::Result<File> {
        fs::create_dir_all(&self.dir)?;
        self.rotate();
        OpenOptions::new().create(true).append(true).open(self.path())
    }
}

/// Buffered file writer that pushes each formatted event to disk at once,
/// so the log is complete even if the process is killed.
struct EventFlushed(BufWriter<File>);

impl Write for EventFlushed {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.0.write(buf)?;
        self.0.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

// ─── Tracing ─────────────────────────────────────────────────────────────────

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, defaulting to `toolbridge=info,warn` with
/// the HTTP stack held at `warn`. With `log_dir`, logs go to
/// `toolbridge.log` there (see [`LogFile::in_dir`]); otherwise to stderr.
/// Does nothing if a subscriber is already set.
pub fn init_tracing(log_dir: Option<&Path>) -> io::Result<()> {
    init_tracing_to(log_dir.map(LogFile::in_dir))
}

/// [`init_tracing`] with an explicit log file layout.
pub fn init_tracing_to(log_file: Option<LogFile>) -> io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolbridge=info,reqwest=warn,hyper=warn,warn"));

    let Some(log_file) = log_file else {
        let _ = fmt::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(true)
            .try_init();
        return Ok(());
    };

    let file = log_file.open()?;
    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(EventFlushed(BufWriter::new(file))))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_file.path().display(),
            keep = log_file.keep,
            pid = std::process::id(),
            "=== toolbridge starting ==="
        );
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
