use crate::cache::{join_lines, Cache, CacheKey};
use crate::error::Result;
use crate::record::CapabilitySet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// One destination write, planned or performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWrite {
    pub key: CacheKey,
    pub destination: PathBuf,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub written: Vec<PlannedWrite>,
    pub failed: Vec<(CacheKey, String)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Applicator<'a> {
    cache: &'a Cache,
    backup: bool,
    noop: bool,
}

impl<'a> Applicator<'a> {
    pub fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            backup: false,
            noop: false,
        }
    }

    pub fn backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    /// Plan only; nothing on disk changes.
    pub fn noop(mut self, noop: bool) -> Self {
        self.noop = noop;
        self
    }

    /// Write every cached entry whose capability is in `capabilities`.
    ///
    /// Other entries stay in the cache untouched. Applied entries are kept
    /// too, so a later `apply` re-commits the same content.
    pub fn apply(&self, capabilities: &CapabilitySet) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        if capabilities.is_empty() {
            debug!("Nothing to apply");
            return Ok(report);
        }

        for key in self.cache.list()? {
            if !capabilities.contains(&key.capability) {
                continue;
            }
            let planned = PlannedWrite {
                destination: key.path.clone(),
                key,
            };

            if self.noop {
                info!(key = %planned.key, destination = %planned.destination.display(), "Would write");
                report.written.push(planned);
                continue;
            }

            match self.commit(&planned) {
                Ok(()) => {
                    info!(key = %planned.key, destination = %planned.destination.display(), "Applied");
                    report.written.push(planned);
                }
                Err(e) => {
                    error!(key = %planned.key, error = %e, "Failed to apply cache entry");
                    report.failed.push((planned.key, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    fn commit(&self, planned: &PlannedWrite) -> Result<()> {
        let lines = self.cache.get_key(&planned.key)?;
        let destination = &planned.destination;

        if let Some(parent) = destination.parent() {
            if !parent.exists() {
                debug!(dir = %parent.display(), "Creating destination directory");
                fs::create_dir_all(parent)?;
            }
        }

        if self.backup && destination.exists() {
            let backup = backup_path(destination);
            if let Err(e) = fs::rename(destination, &backup) {
                warn!(path = %destination.display(), error = %e, "Could not back up");
            }
        }

        fs::write(destination, join_lines(&lines))?;
        Ok(())
    }
}

fn backup_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}
