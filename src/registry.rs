use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::handler::Handler;
use crate::handlers::{builtin_handlers, ExternalHandler, HandlerManifest};

/// Packaged handler manifests.
pub const MODULE_DIR: &str = "/usr/lib/guestlink/handlers";
/// Local administrator overrides.
pub const LOCAL_DIR: &str = "/usr/local/lib/guestlink/handlers";

/// One live instance per handler name, in registration order.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Built-ins followed by everything found on the search path.
    pub async fn build(settings: &Settings) -> Self {
        let mut registry = Self::new();
        for handler in builtin_handlers(settings) {
            registry.register(handler);
        }
        let found = registry.discover(&search_path(settings)).await;
        info!(
            handlers = registry.len(),
            discovered = found,
            "Handler registry ready"
        );
        registry
    }

    /// Returns false (and drops `handler`) when the name is taken.
    pub fn register(&mut self, handler: Box<dyn Handler>) -> bool {
        if self.contains(handler.name()) {
            debug!(handler = %handler.name(), "Ignoring duplicate handler");
            return false;
        }
        self.handlers.push(handler);
        true
    }

    /// Scan manifest directories, registering one external handler per
    /// manifest. Returns how many were added.
    pub async fn discover(&mut self, dirs: &[PathBuf]) -> usize {
        let mut added = 0;
        for dir in dirs {
            match self.discover_dir(dir).await {
                Ok(n) => added += n,
                Err(e) => debug!(dir = %dir.display(), error = %e, "Skipping handler directory"),
            }
        }
        added
    }

    async fn discover_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut manifests = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") && path.is_file() {
                manifests.push(path);
            }
        }
        manifests.sort();

        let mut added = 0;
        for path in manifests {
            match HandlerManifest::load(&path) {
                Ok(manifest) => {
                    let name = manifest.handler.name.clone();
                    if self.register(Box::new(ExternalHandler::new(manifest, &path))) {
                        info!(handler = %name, manifest = %path.display(), "Discovered handler");
                        added += 1;
                    }
                }
                Err(e) => warn!("Failed to load manifest {:?}: {}", path, e),
            }
        }
        Ok(added)
    }

    pub fn get(&self, name: &str) -> Option<&dyn Handler> {
        self.handlers
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.iter().any(|h| h.name() == name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Handler>> {
        self.handlers.iter_mut()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Module dir, local override dir, then operator-supplied directories.
pub fn search_path(settings: &Settings) -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(MODULE_DIR), PathBuf::from(LOCAL_DIR)];
    for dir in &settings.handler_dirs {
        if !dirs.contains(dir) {
            dirs.push(dir.clone());
        }
    }
    dirs
}
