//! Transport over the hypervisor store.
//!
//! Requests appear under `<receive_prefix>/<token>` and are removed as soon as
//! they are read; replies go to `<send_prefix>/<token>`. Version requests, key
//! exchange and the password handshake are answered here and never reach
//! dispatch.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::store::Store;
use super::{Inbound, Reply, Status, Transport, TransportMessage};
use crate::cipher::KeySession;
use crate::config::BusSection;
use crate::error::{AgentError, Result};
use crate::record::ConfigurationRecord;
use crate::translator::{translate, InterfaceTable};
use crate::AGENT_VERSION;

/// Where the key exchange stands.
#[derive(Debug, Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    /// A `password` arrived first and is parked in the queue.
    AwaitingKeyInit,
    /// Keys negotiated; the next `password` consumes them.
    AwaitingPassword(KeySession),
}

impl HandshakeState {
    pub fn label(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::AwaitingKeyInit => "awaiting-keyinit",
            HandshakeState::AwaitingPassword(_) => "awaiting-password",
        }
    }
}

pub struct BusTransport<S: Store> {
    store: S,
    prefixes: BusSection,
    sysfs_net: PathBuf,
    queue: VecDeque<TransportMessage>,
    events: Option<mpsc::UnboundedReceiver<String>>,
    handshake: HandshakeState,
    rng: Box<dyn RngCore + Send>,
    password_attempts: HashMap<String, u32>,
}

impl<S: Store> BusTransport<S> {
    /// Start watching, then replay whatever queued up while we were down.
    pub async fn open(store: S, prefixes: BusSection, sysfs_net: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_rng(store, prefixes, sysfs_net, Box::new(StdRng::from_entropy())).await
    }

    pub async fn open_with_rng(
        store: S,
        prefixes: BusSection,
        sysfs_net: impl Into<PathBuf>,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<Self> {
        let events = store.watch(&prefixes.receive_prefix).await?;
        let mut transport = Self {
            store,
            prefixes,
            sysfs_net: sysfs_net.into(),
            queue: VecDeque::new(),
            events: Some(events),
            handshake: HandshakeState::Idle,
            rng,
            password_attempts: HashMap::new(),
        };

        let pending = transport
            .store
            .list(&transport.prefixes.receive_prefix)
            .await?;
        for token in pending {
            let path = format!("{}/{}", transport.prefixes.receive_prefix, token);
            transport.ingest(&path).await?;
        }
        info!(
            prefix = %transport.prefixes.receive_prefix,
            replayed = transport.queue.len(),
            "Bus transport ready"
        );
        Ok(transport)
    }

    pub fn handshake(&self) -> &HandshakeState {
        &self.handshake
    }

    /// Read and remove one request path, queueing its payload.
    async fn ingest(&mut self, path: &str) -> Result<()> {
        let prefix = format!("{}/", self.prefixes.receive_prefix);
        let Some(token) = path.strip_prefix(&prefix) else {
            trace!(path = %path, "Ignoring watch event outside the request area");
            return Ok(());
        };
        if token.is_empty() || token.contains('/') {
            return Ok(());
        }
        if self.queue.iter().any(|m| m.identifier == token) {
            return Ok(());
        }

        match self.store.read(path).await? {
            Some(payload) => {
                self.store.remove(path).await?;
                debug!(token = %token, bytes = payload.len(), "Queued request");
                self.queue.push_back(TransportMessage {
                    identifier: token.to_string(),
                    payload,
                });
            }
            None => trace!(path = %path, "Request already consumed"),
        }
        Ok(())
    }

    /// Drain watch events that are ready without blocking.
    async fn pump_events(&mut self) -> Result<()> {
        loop {
            let Some(events) = self.events.as_mut() else {
                return Ok(());
            };
            let next = events.try_recv();
            match next {
                Ok(path) => self.ingest(&path).await?,
                Err(_) => return Ok(()),
            }
        }
    }

    async fn next_message(&mut self) -> Result<TransportMessage> {
        loop {
            self.pump_events().await?;
            if let Some(message) = self.queue.pop_front() {
                return Ok(message);
            }
            let events = self
                .events
                .as_mut()
                .ok_or_else(|| AgentError::Transport("bus transport is closed".into()))?;
            let next = events.recv().await;
            match next {
                Some(path) => self.ingest(&path).await?,
                None => return Err(AgentError::Transport("store watch ended".into())),
            }
        }
    }

    async fn key_exchange(&mut self, identifier: &str, record: &ConfigurationRecord) {
        let peer = record.arguments.as_deref().unwrap_or_default();
        match KeySession::negotiate(peer, self.rng.as_mut()) {
            Ok(session) => {
                if matches!(self.handshake, HandshakeState::AwaitingPassword(_)) {
                    debug!("Replacing a pending key session");
                }
                let public = session.public_key().to_string();
                self.handshake = HandshakeState::AwaitingPassword(session);
                info!(token = %identifier, "Key exchange answered");
                self.send(identifier, &public, Status::KeyInit).await;
            }
            Err(e) => {
                warn!(token = %identifier, error = %e, "Key exchange failed");
                self.send(identifier, &e.to_string(), Status::Failure).await;
            }
        }
    }

    /// `Some` when the password was decrypted and should be dispatched.
    async fn password(
        &mut self,
        message: TransportMessage,
        mut record: ConfigurationRecord,
    ) -> Option<ConfigurationRecord> {
        let identifier = message.identifier.clone();

        if let HandshakeState::AwaitingPassword(session) = std::mem::take(&mut self.handshake) {
            self.password_attempts.remove(&identifier);
            let ciphertext = record.arguments.take().unwrap_or_default();
            return match session.decrypt_password(&ciphertext) {
                Ok(password) => {
                    info!(token = %identifier, "Password decrypted");
                    record.password = Some(password);
                    Some(record)
                }
                Err(e) => {
                    warn!(token = %identifier, error = %e, "Password decryption failed");
                    self.send(&identifier, "password decryption failed", Status::Failure)
                        .await;
                    None
                }
            };
        }

        let attempts = self.password_attempts.entry(identifier.clone()).or_insert(0);
        *attempts += 1;
        if *attempts > self.prefixes.password_retries {
            self.password_attempts.remove(&identifier);
            self.handshake = HandshakeState::Idle;
            warn!(token = %identifier, "Gave up waiting for a key exchange");
            self.send(&identifier, "no key exchange before password", Status::Failure)
                .await;
            return None;
        }

        trace!(token = %identifier, attempt = *attempts, "Password before keyinit, requeueing");
        self.handshake = HandshakeState::AwaitingKeyInit;
        tokio::time::sleep(Duration::from_millis(self.prefixes.password_retry_ms)).await;
        if let Err(e) = self.pump_events().await {
            warn!(error = %e, "Polling for new requests failed");
        }
        self.queue.push_back(message);
        None
    }

    /// Fold per-interface metadata and the hostname into a reset record.
    async fn reset_network(
        &mut self,
        mut record: ConfigurationRecord,
        interfaces: &InterfaceTable,
    ) -> ConfigurationRecord {
        let macs: Vec<String> = interfaces.macs().map(str::to_string).collect();
        for mac in macs {
            let path = format!(
                "{}/networking/{}",
                self.prefixes.data_prefix,
                mac.replace(':', "").to_lowercase()
            );
            match self.store.read(&path).await {
                Ok(Some(payload)) => {
                    let mut entry = translate(&payload, interfaces);
                    entry.function.clear();
                    record.merge(entry);
                }
                Ok(None) => debug!(path = %path, "No network metadata for interface"),
                Err(e) => warn!(path = %path, error = %e, "Reading network metadata failed"),
            }
        }

        let path = format!("{}/hostname", self.prefixes.data_prefix);
        match self.store.read(&path).await {
            Ok(Some(raw)) => {
                let hostname = serde_json::from_slice::<String>(&raw)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&raw).trim().to_string());
                if !hostname.is_empty() {
                    record.hostname = Some(hostname);
                }
            }
            Ok(None) => debug!(path = %path, "No hostname metadata"),
            Err(e) => warn!(path = %path, error = %e, "Reading hostname failed"),
        }
        record
    }
}

#[async_trait]
impl<S: Store> Transport for BusTransport<S> {
    async fn receive(&mut self) -> Result<Inbound> {
        loop {
            let message = self.next_message().await?;
            let interfaces = InterfaceTable::scan(&self.sysfs_net);
            let mut record = translate(&message.payload, &interfaces);
            let identifier = message.identifier.clone();
            debug!(
                token = %identifier,
                function = %record.function,
                handshake = self.handshake.label(),
                "Bus request"
            );

            let function = record.function.clone();
            match function.as_str() {
                "version" => {
                    self.send(&identifier, AGENT_VERSION, Status::Ok).await;
                    continue;
                }
                "keyinit" => {
                    self.key_exchange(&identifier, &record).await;
                    continue;
                }
                "password" => match self.password(message, record).await {
                    Some(record) => return Ok(Inbound { identifier, record }),
                    None => continue,
                },
                "resetnetwork" => {
                    record = self.reset_network(record, &interfaces).await;
                }
                "injectfile" => record.function = "file".to_string(),
                "agentupdate" => record.function = "update".to_string(),
                _ => {}
            }

            return Ok(Inbound { identifier, record });
        }
    }

    async fn send(&mut self, identifier: &str, message: &str, status: Status) {
        let path = format!("{}/{}", self.prefixes.send_prefix, identifier);
        let body = match Reply::new(status, message).to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Could not encode reply");
                return;
            }
        };
        match self.store.write(&path, body.as_bytes()).await {
            Ok(()) => debug!(path = %path, status = %status, "Reply sent"),
            Err(e) => warn!(path = %path, error = %e, "Reply dropped"),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.events = None;
        self.queue.clear();
        self.handshake = HandshakeState::Idle;
        info!("Bus transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{private_key, public_key};
    use crate::transport::store::MemoryStore;

    fn prefixes() -> BusSection {
        BusSection {
            password_retry_ms: 1,
            password_retries: 5,
            ..BusSection::default()
        }
    }

    fn reply(store: &MemoryStore, token: &str) -> Option<Reply> {
        store
            .get(&format!("data/guest/{}", token))
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_version_is_answered_inline() {
        let store = MemoryStore::new();
        store
            .write("data/host/1", br#"{"name":"version","value":"agent"}"#)
            .await
            .unwrap();
        store
            .write("data/host/2", br#"{"name":"features"}"#)
            .await
            .unwrap();

        let mut bus = BusTransport::open(store.clone(), prefixes(), "/nonexistent")
            .await
            .unwrap();
        let inbound = bus.receive().await.unwrap();

        assert_eq!(inbound.identifier, "2");
        assert_eq!(inbound.record.function, "features");
        assert_eq!(reply(&store, "1"), Some(Reply::new(Status::Ok, AGENT_VERSION)));
        assert!(store.get("data/host/1").is_none());
    }

    #[tokio::test]
    async fn test_rewrites_hypervisor_names() {
        let store = MemoryStore::new();
        let mut bus = BusTransport::open(store.clone(), prefixes(), "/nonexistent")
            .await
            .unwrap();
        store
            .write("data/host/7", br#"{"name":"injectfile","value":"abc"}"#)
            .await
            .unwrap();
        let inbound = bus.receive().await.unwrap();
        assert_eq!(inbound.record.function, "file");
        assert_eq!(inbound.record.arguments.as_deref(), Some("abc"));

        store
            .write("data/host/8", br#"{"name":"agentupdate"}"#)
            .await
            .unwrap();
        assert_eq!(bus.receive().await.unwrap().record.function, "update");
    }

    #[tokio::test]
    async fn test_keyinit_then_password() {
        let store = MemoryStore::new();
        let mut host_rng = StdRng::seed_from_u64(99);
        let host_private = private_key(&mut host_rng);

        let mut bus = BusTransport::open_with_rng(
            store.clone(),
            prefixes(),
            "/nonexistent",
            Box::new(StdRng::seed_from_u64(3)),
        )
        .await
        .unwrap();

        let keyinit = format!(r#"{{"name":"keyinit","value":"{}"}}"#, public_key(host_private));
        store.write("data/host/k", keyinit.as_bytes()).await.unwrap();
        store.write("data/host/z", br#"{"name":"features"}"#).await.unwrap();
        // keyinit is consumed inline; features comes out.
        assert_eq!(bus.receive().await.unwrap().record.function, "features");

        let answer = reply(&store, "k").unwrap();
        assert_eq!(answer.returncode, "D0");
        let guest_public: u128 = answer.message.parse().unwrap();
        assert!(matches!(bus.handshake(), HandshakeState::AwaitingPassword(_)));

        let host = KeySession::from_private(host_private, guest_public);
        let password = format!(
            r#"{{"name":"password","value":"{}"}}"#,
            host.encrypt_password("hunter2")
        );
        store.write("data/host/p", password.as_bytes()).await.unwrap();

        let inbound = bus.receive().await.unwrap();
        assert_eq!(inbound.record.function, "password");
        assert_eq!(inbound.record.password.as_deref(), Some("hunter2"));
        assert!(inbound.record.arguments.is_none());
        assert!(matches!(bus.handshake(), HandshakeState::Idle));
    }

    #[tokio::test]
    async fn test_orphan_password_fails_after_retries() {
        let store = MemoryStore::new();
        store
            .write("data/host/p", br#"{"name":"password","value":"AAAA"}"#)
            .await
            .unwrap();
        store
            .write("data/host/q", br#"{"name":"features"}"#)
            .await
            .unwrap();

        let settings = BusSection {
            password_retries: 1,
            ..prefixes()
        };
        let mut bus = BusTransport::open(store.clone(), settings, "/nonexistent")
            .await
            .unwrap();

        // features is dispatched while the password waits its turn.
        assert_eq!(bus.receive().await.unwrap().record.function, "features");

        store.write("data/host/r", br#"{"name":"hostname"}"#).await.unwrap();
        let inbound = bus.receive().await.unwrap();
        assert_eq!(inbound.identifier, "r");

        let failure = reply(&store, "p").unwrap();
        assert_eq!(failure.returncode, "500");
        assert!(matches!(bus.handshake(), HandshakeState::Idle));
    }

    #[tokio::test]
    async fn test_bad_ciphertext_clears_session() {
        let store = MemoryStore::new();
        let mut bus = BusTransport::open_with_rng(
            store.clone(),
            prefixes(),
            "/nonexistent",
            Box::new(StdRng::seed_from_u64(5)),
        )
        .await
        .unwrap();

        store
            .write("data/host/a", br#"{"name":"keyinit","value":"12345"}"#)
            .await
            .unwrap();
        store
            .write("data/host/b", br#"{"name":"password","value":"bm90LWJsb2Nrcw=="}"#)
            .await
            .unwrap();
        store.write("data/host/c", br#"{"name":"features"}"#).await.unwrap();

        assert_eq!(bus.receive().await.unwrap().identifier, "c");
        assert_eq!(reply(&store, "b").unwrap().returncode, "500");
        assert!(matches!(bus.handshake(), HandshakeState::Idle));
    }
}
