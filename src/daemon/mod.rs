//! Guestlink daemon - the long-running agent.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               guestlink daemon             │
//! ├────────────────────────────────────────────┤
//! │  Transport  │  Dispatcher  │  Applicator   │
//! │ (bus/socket)│  (handlers)  │  (cache→fs)   │
//! ├────────────────────────────────────────────┤
//! │  pidfile lock │ SIGHUP reload │ SIGTERM    │
//! └────────────────────────────────────────────┘
//! ```

pub mod control;
pub mod pidfile;
pub mod server;

pub use control::DaemonStatus;
pub use pidfile::PidFile;
pub use server::DaemonServer;
