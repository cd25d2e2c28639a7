use crate::clienv;
use crate::error::{AgentError, Result};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Interactive terminal, coloured.
    Stderr,
    /// Service manager journal: plain stderr.
    Syslog,
    File(std::path::PathBuf),
}

impl LogTarget {
    pub fn parse(handler: &str) -> Self {
        match handler {
            "-" | "stderr" | "console" => LogTarget::Stderr,
            "syslog" | "journal" => LogTarget::Syslog,
            path => LogTarget::File(path.into()),
        }
    }
}

/// Map an operator level name onto a tracing directive.
pub fn level_directive(loglevel: &str) -> &'static str {
    match loglevel.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warning" | "warn" => "warn",
        "error" | "critical" | "fatal" => "error",
        _ => "info",
    }
}

fn filter_for(loglevel: &str) -> EnvFilter {
    if clienv::rust_log_set() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
    }
    EnvFilter::new(level_directive(loglevel))
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init(loglevel: &str, loghandler: &str) -> Result<()> {
    let filter = filter_for(loglevel);

    let installed = match LogTarget::parse(loghandler) {
        LogTarget::Stderr => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init(),
        LogTarget::Syslog => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .without_time(),
            )
            .try_init(),
        LogTarget::File(path) => {
            let file = open_log_file(&path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false),
                )
                .try_init()
        }
    };

    installed.map_err(|e| AgentError::Other(format!("failed to install logger: {}", e)))
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}
