use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::error::{AgentError, Result};
use crate::handler::{Handler, Output};
use crate::record::ConfigurationRecord;

pub const ETC_HOSTS: &str = "/etc/hosts";

const LOOPBACKS: [&str; 2] = ["127.0.0.1", "::1"];

/// Adds the hostname to the loopback entries of `/etc/hosts`.
pub struct HostsHandler {
    path: PathBuf,
}

impl HostsHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for HostsHandler {
    fn default() -> Self {
        Self::new(ETC_HOSTS)
    }
}

fn loopback_of(line: &str) -> Option<&'static str> {
    let first = line.split_whitespace().next()?;
    LOOPBACKS.into_iter().find(|lo| *lo == first)
}

fn names_host(line: &str, hostname: &str) -> bool {
    line.split_whitespace().skip(1).any(|name| name == hostname)
}

#[async_trait]
impl Handler for HostsHandler {
    fn name(&self) -> &str {
        "HostsHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        let Some(hostname) = record.hostname.as_deref() else {
            info!("Must be passed a hostname in the message");
            return false;
        };
        let Ok(content) = fs::read_to_string(&self.path) else {
            info!(path = %self.path.display(), "Hosts file is not readable");
            return false;
        };

        let covered = LOOPBACKS.iter().all(|lo| {
            content
                .lines()
                .any(|line| loopback_of(line) == Some(*lo) && names_host(line, hostname))
        });
        if covered {
            info!(hostname = %hostname, "Hostname already present on loopback entries");
        }
        !covered
    }

    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let hostname = record
            .hostname
            .as_deref()
            .ok_or_else(|| AgentError::handler(self.name(), "no hostname"))?;
        let content = fs::read_to_string(&self.path)?;

        let lines: Vec<String> = content
            .lines()
            .map(|line| {
                if loopback_of(line).is_some() && !names_host(line, hostname) {
                    format!("{} {}", line, hostname)
                } else {
                    line.to_string()
                }
            })
            .collect();

        Ok(vec![Output::file(self.path.clone(), lines)])
    }
}
