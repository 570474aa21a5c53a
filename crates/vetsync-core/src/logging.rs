//! Structured logging for vetsync
//!
//! Uses `tracing` with configurable output formats and destinations.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `mutation_id`, `kind`, `attempt`: client queue items
//! - `operation_key`, `operation_class`, `caller`: server requests
//! - `circuit`, `priority`: resilience decisions
//!
//! Payload contents are never logged; they may carry clinical notes.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// HTTP client and server internals stay at `warn` unless tracing everything.
const QUIET_DEPENDENCIES: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls"];

type FilteredRegistry = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    /// Can be overridden by RUST_LOG environment variable
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to an append-only log file
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// Apply a `-v` count from the command line.
    ///
    /// Without `-v`, one-shot commands log at `warn` so their stdout stays
    /// clean; long-running ones (the server) keep the configured level.
    #[must_use]
    pub fn with_verbosity(mut self, verbose: u8, long_running: bool) -> Self {
        self.level = match verbose {
            0 if long_running => self.level,
            0 => "warn".to_string(),
            1 => "info".to_string(),
            _ => "debug".to_string(),
        };
        self
    }

    /// Filter directives for the configured level.
    #[must_use]
    pub fn directives(&self) -> String {
        let level = self.level.trim().to_ascii_lowercase();
        if level == "trace" {
            return level;
        }
        let mut directives = level;
        for target in QUIET_DEPENDENCIES {
            directives.push_str(&format!(",{target}=warn"));
        }
        directives
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Open `path` for appending, creating it owner-only if new.
fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    ensure_parent_dir(path)?;
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if !existed {
        restrict_to_owner(path)?;
    }
    Ok(file)
}

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .with_ansi(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, file: std::fs::File) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(file)
            .with_target(true)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(file)
            .with_current_span(true)
            .flatten_event(true)
            .boxed(),
    }
}

/// Initialize the global logging subscriber
///
/// Call once at startup. Subsequent calls return
/// `Err(LogError::AlreadyInitialized)`.
///
/// `RUST_LOG` overrides the configured level, e.g.
/// `RUST_LOG=vetsync_core::sync_engine=debug`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let mut layers = vec![stderr_layer(config.format)];
    if let Some(path) = &config.file {
        layers.push(file_layer(config.format, open_log_file(path)?));
    }

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(env_filter).with(layers),
    )?;
    let _ = LOGGING_INITIALIZED.set(());

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
    }

    #[test]
    fn verbosity_levels() {
        let base = LogConfig {
            level: "error".to_string(),
            ..LogConfig::default()
        };
        assert_eq!(base.clone().with_verbosity(0, true).level, "error");
        assert_eq!(base.clone().with_verbosity(0, false).level, "warn");
        assert_eq!(base.clone().with_verbosity(1, false).level, "info");
        assert_eq!(base.with_verbosity(3, true).level, "debug");
    }

    #[test]
    fn directives_quiet_transport_crates() {
        let config = LogConfig {
            level: " Debug ".to_string(),
            ..LogConfig::default()
        };
        let directives = config.directives();
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("hyper=warn"));
        assert!(directives.contains("reqwest=warn"));
        EnvFilter::try_new(&directives).unwrap();

        let trace = LogConfig {
            level: "trace".to_string(),
            ..LogConfig::default()
        };
        assert_eq!(trace.directives(), "trace");
    }

    #[test]
    fn log_config_from_toml_section() {
        let config: LogConfig =
            toml::from_str("level = \"debug\"\nformat = \"json\"\nfile = \"/tmp/vetsync.log\"\n")
                .unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/vetsync.log")));
    }

    #[cfg(unix)]
    #[test]
    fn new_log_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("vetsync.log");
        drop(open_log_file(&path).unwrap());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
