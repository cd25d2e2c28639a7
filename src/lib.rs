pub mod applicator;
pub mod cache;
pub mod cipher;
pub mod clienv;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod logging;
pub mod record;
pub mod registry;
pub mod translator;
pub mod transport;

pub use error::{AgentError, Result};
pub use handler::{Handler, Output};
pub use record::{CapabilitySet, ConfigurationRecord};
pub use registry::HandlerRegistry;

/// Reported to `version` requests and in the versions table.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
