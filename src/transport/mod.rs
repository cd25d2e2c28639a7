//! Control channels carrying request/reply pairs between the hypervisor
//! (or local tooling) and the agent.

pub mod bus;
pub mod socket;
pub mod store;

pub use bus::BusTransport;
pub use socket::SocketTransport;
pub use store::{MemoryStore, Store, XenStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::record::ConfigurationRecord;

/// Reply return codes understood by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Reply to a key exchange; the message is our public key.
    KeyInit,
    Failure,
}

impl Status {
    pub fn code(&self) -> &'static str {
        match self {
            Status::Ok => "0",
            Status::KeyInit => "D0",
            Status::Failure => "500",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Wire envelope for every reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub returncode: String,
    pub message: String,
}

impl Reply {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            returncode: status.code().to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One raw inbound message, before translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Transport-specific reply handle.
    pub identifier: String,
    pub payload: Vec<u8>,
}

/// A translated request ready for dispatch.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub identifier: String,
    pub record: ConfigurationRecord,
}

#[async_trait]
pub trait Transport: Send {
    /// Wait for the next request that needs dispatching.
    ///
    /// Protocol-internal exchanges are answered inside this call and never
    /// returned.
    async fn receive(&mut self) -> Result<Inbound>;

    /// Best-effort reply; a vanished peer is not an error.
    async fn send(&mut self, identifier: &str, message: &str, status: Status);

    /// Release the channel.
    async fn close(&mut self) -> Result<()>;
}
