use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::Result;
use crate::handler::{Handler, Output};
use crate::record::ConfigurationRecord;

pub const CONFD_NET: &str = "/etc/conf.d/net";

/// Renders `/etc/conf.d/net` from the record's addresses and routes.
pub struct NetworkHandler {
    path: PathBuf,
}

impl NetworkHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for NetworkHandler {
    fn default() -> Self {
        Self::new(CONFD_NET)
    }
}

#[async_trait]
impl Handler for NetworkHandler {
    fn name(&self) -> &str {
        "NetworkHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        if !record.has("ips") {
            info!("Must be passed ips in the message");
            return false;
        }
        match self.path.parent() {
            Some(dir) if dir.is_dir() => true,
            _ => {
                info!(path = %self.path.display(), "No directory to write network configuration into");
                false
            }
        }
    }

    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let mut lines = Vec::new();

        for (interface, addresses) in &record.ips {
            lines.push(format!("config_{}=\"", interface));
            lines.extend(addresses.iter().map(|a| a.cidr.clone()));
            lines.push("\"".to_string());
        }

        for (interface, routes) in &record.routes {
            debug!(interface = %interface, count = routes.len(), "Rendering routes");
            lines.push(format!("routes_{}=\"", interface));
            lines.extend(
                routes
                    .iter()
                    .map(|r| format!("{} via {}", r.destination, r.gateway)),
            );
            lines.push("\"".to_string());
        }

        Ok(vec![Output::file(self.path.clone(), lines)])
    }
}
