//! Local control socket for trusted tooling.
//!
//! A request is a run of JSON lines ended by a blank line (or EOF). The reply
//! is one JSON object written without a terminator, after which the
//! connection is shut down. Names pass through untouched.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, trace, warn};

use super::{Inbound, Reply, Status, Transport};
use crate::error::{AgentError, Result};
use crate::translator::{translate, InterfaceTable};

pub struct SocketTransport {
    path: PathBuf,
    sysfs_net: PathBuf,
    listener: Option<UnixListener>,
    connections: HashMap<String, UnixStream>,
    accepted: u64,
}

impl SocketTransport {
    /// Bind the socket, replacing a stale one, readable by root only.
    pub fn open(path: impl Into<PathBuf>, sysfs_net: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        info!("Control socket listening on: {}", path.display());
        Ok(Self {
            path,
            sysfs_net: sysfs_net.into(),
            listener: Some(listener),
            connections: HashMap::new(),
            accepted: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one blank-line terminated request.
    async fn read_request(stream: UnixStream) -> std::io::Result<(UnixStream, Vec<u8>)> {
        let mut reader = BufReader::new(stream);
        let mut payload = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line.trim().is_empty() {
                break;
            }
            payload.extend_from_slice(line.as_bytes());
        }
        Ok((reader.into_inner(), payload))
    }
}

fn peer_gone(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}

#[async_trait]
impl Transport for SocketTransport {
    async fn receive(&mut self) -> Result<Inbound> {
        loop {
            let listener = self
                .listener
                .as_ref()
                .ok_or_else(|| AgentError::Transport("control socket is closed".into()))?;

            let (stream, _) = listener.accept().await?;
            trace!("New connection accepted");

            let (stream, payload) = match Self::read_request(stream).await {
                Ok(read) => read,
                Err(e) => {
                    warn!(error = %e, "Failed to read request");
                    continue;
                }
            };
            if payload.is_empty() {
                debug!("Connection closed without a request");
                continue;
            }

            self.accepted += 1;
            let identifier = self.accepted.to_string();
            let interfaces = InterfaceTable::scan(&self.sysfs_net);
            let record = translate(&payload, &interfaces);
            debug!(connection = %identifier, function = %record.function, "Socket request");

            self.connections.insert(identifier.clone(), stream);
            return Ok(Inbound { identifier, record });
        }
    }

    async fn send(&mut self, identifier: &str, message: &str, status: Status) {
        let Some(mut stream) = self.connections.remove(identifier) else {
            debug!(connection = %identifier, "No open connection for reply");
            return;
        };
        let body = match Reply::new(status, message).to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Could not encode reply");
                return;
            }
        };

        let written = async {
            stream.write_all(body.as_bytes()).await?;
            stream.flush().await?;
            stream.shutdown().await
        }
        .await;

        match written {
            Ok(()) => trace!(connection = %identifier, "Reply sent"),
            Err(e) if peer_gone(e.kind()) => {
                debug!(connection = %identifier, "Peer went away before the reply")
            }
            Err(e) => warn!(connection = %identifier, error = %e, "Reply dropped"),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.listener = None;
        self.connections.clear();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        info!(path = %self.path.display(), "Control socket closed");
        Ok(())
    }
}
