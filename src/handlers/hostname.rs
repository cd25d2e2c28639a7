use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use crate::error::{AgentError, Result};
use crate::handler::{Handler, Output};
use crate::record::ConfigurationRecord;

pub const ETC_HOSTNAME: &str = "/etc/hostname";

/// Writes the short host name to `/etc/hostname`.
pub struct HostnameHandler {
    path: PathBuf,
}

impl HostnameHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for HostnameHandler {
    fn default() -> Self {
        Self::new(ETC_HOSTNAME)
    }
}

#[async_trait]
impl Handler for HostnameHandler {
    fn name(&self) -> &str {
        "HostnameHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        if record.hostname.as_deref().map_or(true, str::is_empty) {
            info!("Must be passed a hostname in the message");
            return false;
        }
        self.path.parent().is_some_and(|dir| dir.is_dir())
    }

    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let hostname = record
            .hostname
            .as_deref()
            .ok_or_else(|| AgentError::handler(self.name(), "no hostname"))?;
        let short = hostname.split('.').next().unwrap_or(hostname);
        Ok(vec![Output::file(self.path.clone(), [short])])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_short_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostname");
        let mut handler = HostnameHandler::new(&path);

        let mut record = ConfigurationRecord::new("hostname");
        record.hostname = Some("box.example.com".into());

        assert!(handler.is_runnable(&record));
        assert_eq!(
            handler.produce(&record).await.unwrap(),
            vec![Output::file(path, ["box"])]
        );
    }

    #[test]
    fn test_empty_hostname_not_runnable() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = HostnameHandler::new(dir.path().join("hostname"));
        let mut record = ConfigurationRecord::new("hostname");
        record.hostname = Some(String::new());
        assert!(!handler.is_runnable(&record));
    }
}
