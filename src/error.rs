use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid cache key '{key}': {reason}")]
    InvalidCacheKey { key: String, reason: String },

    #[error("cache entry '{key}' failed: {source}")]
    Cache {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handler '{name}' failed: {reason}")]
    Handler { name: String, reason: String },

    #[error("another instance holds {path} (pid {pid:?})")]
    AlreadyRunning { path: PathBuf, pid: Option<i32> },

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn handler(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Handler {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCacheKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
