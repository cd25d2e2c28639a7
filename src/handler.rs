use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;
use crate::record::{CapabilitySet, ConfigurationRecord};

/// Reply sentinel an external handler uses in place of a path.
pub const MESSAGE_KEY: &str = "message";

/// One piece of handler output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Content destined for an absolute path, staged through the cache.
    File { path: PathBuf, lines: Vec<String> },
    /// Text appended to the reply sent back to the peer.
    Message(String),
}

impl Output {
    pub fn file<S: Into<String>>(path: impl Into<PathBuf>, lines: impl IntoIterator<Item = S>) -> Self {
        Output::File {
            path: path.into(),
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Output::Message(text.into())
    }
}

/// Core trait for configuration handlers.
/// Implement this trait to teach the agent a new capability.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Unique type name, e.g. `NetworkHandler`.
    fn name(&self) -> &str;

    /// Capabilities this handler claims (default: derived from the name)
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from([capability_from_name(self.name())])
    }

    /// Whether this handler applies to `record` on this system.
    ///
    /// May resolve and remember an executable path for `produce`.
    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool;

    /// Produce file contents and reply text for `record`
    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>>;
}

/// `NetworkHandler` → `network`.
pub fn capability_from_name(name: &str) -> String {
    name.strip_suffix("Handler").unwrap_or(name).to_lowercase()
}

/// Running as root?
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Macro for the compiled-in handler list
#[macro_export]
macro_rules! register_handlers {
    ($settings:ident => [$($handler:expr),* $(,)?]) => {
        pub fn builtin_handlers(
            $settings: &$crate::config::Settings,
        ) -> Vec<Box<dyn $crate::handler::Handler>> {
            vec![$(Box::new($handler) as Box<dyn $crate::handler::Handler>),*]
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_from_name() {
        assert_eq!(capability_from_name("NetworkHandler"), "network");
        assert_eq!(capability_from_name("ResolversHandler"), "resolvers");
        assert_eq!(capability_from_name("Ntp"), "ntp");
    }

    #[test]
    fn test_output_file_collects_lines() {
        let out = Output::file("/etc/hostname", ["box"]);
        assert_eq!(
            out,
            Output::File {
                path: PathBuf::from("/etc/hostname"),
                lines: vec!["box".to_string()]
            }
        );
    }
}
