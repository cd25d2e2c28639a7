use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::error::Result;
use crate::handler::{Handler, Output};
use crate::record::ConfigurationRecord;

pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Merges nameservers (and a domain/search pair from the hostname) into
/// `/etc/resolv.conf`.
pub struct ResolversHandler {
    path: PathBuf,
}

impl ResolversHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ResolversHandler {
    fn default() -> Self {
        Self::new(RESOLV_CONF)
    }
}

fn existing_nameservers(content: &str) -> BTreeSet<&str> {
    content
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("nameserver"), Some(ip)) => Some(ip),
                _ => None,
            }
        })
        .collect()
}

fn has_directive(lines: &[String], directive: &str) -> bool {
    lines
        .iter()
        .any(|l| l.split_whitespace().next() == Some(directive))
}

/// Last two labels of a fully qualified name.
fn domain_of(hostname: &str) -> Option<String> {
    let labels: Vec<&str> = hostname.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}

#[async_trait]
impl Handler for ResolversHandler {
    fn name(&self) -> &str {
        "ResolversHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        if !record.has("resolvers") {
            info!("Must be passed resolver information in the message");
            return false;
        }
        let Ok(content) = fs::read_to_string(&self.path) else {
            info!(path = %self.path.display(), "Resolver configuration is not readable");
            return false;
        };

        let existing = existing_nameservers(&content);
        if record
            .resolvers
            .iter()
            .all(|r| existing.contains(r.address.as_str()))
        {
            info!("The passed resolvers are already in use");
            return false;
        }
        true
    }

    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let content = fs::read_to_string(&self.path)?;
        let mut lines: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();

        if let Some(domain) = record.hostname.as_deref().and_then(domain_of) {
            if !has_directive(&lines, "domain") {
                lines.push(format!("domain {}", domain));
            }
            if !has_directive(&lines, "search") {
                lines.push(format!("search {}", domain));
            }
        }

        let mut known: BTreeSet<String> = existing_nameservers(&content)
            .into_iter()
            .map(str::to_string)
            .collect();
        for resolver in &record.resolvers {
            if known.insert(resolver.address.clone()) {
                lines.push(format!("nameserver {}", resolver.address));
            }
        }

        Ok(vec![Output::file(self.path.clone(), lines)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{IpVersion, Resolver};

    fn record(addresses: &[&str]) -> ConfigurationRecord {
        let mut record = ConfigurationRecord::new("resetnetwork");
        for address in addresses {
            record.add_resolver(Resolver {
                address: address.to_string(),
                version: IpVersion::Ipv4,
                interface: "eth0".into(),
            });
        }
        record
    }

    #[tokio::test]
    async fn test_merges_new_nameservers_and_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(&path, "nameserver 8.8.8.8\n").unwrap();

        let mut handler = ResolversHandler::new(&path);
        let mut record = record(&["8.8.8.8", "72.3.128.240"]);
        record.hostname = Some("box.example.com".into());

        assert!(handler.is_runnable(&record));
        assert_eq!(
            handler.produce(&record).await.unwrap(),
            vec![Output::file(
                path,
                [
                    "nameserver 8.8.8.8",
                    "domain example.com",
                    "search example.com",
                    "nameserver 72.3.128.240",
                ]
            )]
        );
    }

    #[test]
    fn test_not_runnable_when_all_listed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(&path, "nameserver 8.8.8.8\nnameserver 8.8.4.4\n").unwrap();
        let mut handler = ResolversHandler::new(&path);
        assert!(!handler.is_runnable(&record(&["8.8.4.4"])));
        assert!(!handler.is_runnable(&record(&[])));
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("a.b.example.com").as_deref(), Some("example.com"));
        assert_eq!(domain_of("box"), None);
    }
}
