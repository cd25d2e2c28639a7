use std::path::PathBuf;

/// Environment variables the agent honours.
#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    GuestlinkConfig,
    GuestlinkCache,
    GuestlinkPidfile,
    RustLog,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::GuestlinkConfig => "GUESTLINK_CONFIG",
            EnvVar::GuestlinkCache => "GUESTLINK_CACHE",
            EnvVar::GuestlinkPidfile => "GUESTLINK_PIDFILE",
            EnvVar::RustLog => "RUST_LOG",
        }
    }
}

/// Non-empty value of an environment variable.
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.trim().is_empty())
}

/// Configuration file override ($GUESTLINK_CONFIG)
pub fn config_path() -> Option<PathBuf> {
    let val = env_opt(EnvVar::GuestlinkConfig).map(PathBuf::from);
    tracing::trace!(value = ?val, "GUESTLINK_CONFIG env var");
    val
}

/// Cache directory override ($GUESTLINK_CACHE)
pub fn cache_dir() -> Option<PathBuf> {
    let val = env_opt(EnvVar::GuestlinkCache).map(PathBuf::from);
    tracing::trace!(value = ?val, "GUESTLINK_CACHE env var");
    val
}

/// Pidfile override ($GUESTLINK_PIDFILE)
pub fn pidfile_path() -> Option<PathBuf> {
    let val = env_opt(EnvVar::GuestlinkPidfile).map(PathBuf::from);
    tracing::trace!(value = ?val, "GUESTLINK_PIDFILE env var");
    val
}

/// Whether $RUST_LOG is set, in which case it beats --loglevel.
pub fn rust_log_set() -> bool {
    env_opt(EnvVar::RustLog).is_some()
}
