use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{AgentError, Result};

#[async_trait]
pub trait Store: Send + Sync {
    /// `None` when the path does not exist.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn write(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Names of the immediate children of `path`.
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Removing a missing path is not an error.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Stream of changed paths at or below `path`.
    async fn watch(&self, path: &str) -> Result<mpsc::UnboundedReceiver<String>>;
}

/// Talks to xenstore through the standard command-line tools.
#[derive(Debug, Clone, Default)]
pub struct XenStore;

// Values go through the tools in raw mode (`-R`): without it they unescape
// on write and escape on read, which mangles backslashes in JSON replies.
const RAW: &str = "-R";

fn read_args(path: &str) -> [&str; 2] {
    [RAW, path]
}

fn write_args<'a>(path: &'a str, value: &'a str) -> [&'a str; 3] {
    [RAW, path, value]
}

impl XenStore {
    async fn tool(program: &str, args: &[&str]) -> Result<std::process::Output> {
        trace!(program = %program, args = ?args, "xenstore call");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AgentError::Transport(format!("{}: {}", program, e)))
    }
}

#[async_trait]
impl Store for XenStore {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let output = Self::tool("xenstore-read", &read_args(path)).await?;
        if !output.status.success() {
            debug!(path = %path, "xenstore-read found nothing");
            return Ok(None);
        }
        let mut value = output.stdout;
        if value.last() == Some(&b'\n') {
            value.pop();
        }
        Ok(Some(value))
    }

    async fn write(&self, path: &str, value: &[u8]) -> Result<()> {
        let value = String::from_utf8_lossy(value);
        let output = Self::tool("xenstore-write", &write_args(path, &value)).await?;
        if !output.status.success() {
            return Err(AgentError::Transport(format!(
                "xenstore-write {} failed: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let output = Self::tool("xenstore-list", &[path]).await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let output = Self::tool("xenstore-rm", &[path]).await?;
        if !output.status.success() {
            debug!(path = %path, "xenstore-rm failed, assuming already gone");
        }
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut child = Command::new("xenstore-watch")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Transport(format!("xenstore-watch: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transport("xenstore-watch has no stdout".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let watched = path.to_string();
        tokio::spawn(async move {
            // The child lives as long as this task; dropping it kills the watch.
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            warn!(path = %watched, "xenstore-watch ended");
        });
        Ok(rx)
    }
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, Vec<u8>>,
    watchers: Vec<(String, mpsc::UnboundedSender<String>)>,
}

/// In-process store with the same semantics, for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| AgentError::Transport("memory store poisoned".into()))
    }

    /// Snapshot of one value as text.
    pub fn get(&self, path: &str) -> Option<String> {
        let state = self.lock().ok()?;
        state
            .entries
            .get(path)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Every path currently stored.
    pub fn paths(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.entries.get(path).cloned())
    }

    async fn write(&self, path: &str, value: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        state.entries.insert(path.to_string(), value.to_vec());
        state
            .watchers
            .retain(|(prefix, tx)| !under(path, prefix) || tx.send(path.to_string()).is_ok());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<String> = state
            .entries
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        children.dedup();
        Ok(children)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.entries.retain(|k, _| !under(k, path));
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // xenstore fires once for the watched path on registration.
        let _ = tx.send(path.to_string());
        self.lock()?.watchers.push((path.to_string(), tx));
        Ok(rx)
    }
}
