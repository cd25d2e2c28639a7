use crate::error::{AgentError, Result};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub capability: String,
    pub path: PathBuf,
}

impl CacheKey {
    pub fn new(capability: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let key = Self {
            capability: capability.into(),
            path: path.into(),
        };
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> Result<()> {
        let cap = &self.capability;
        if cap.is_empty() || cap.contains(['.', '/']) {
            return Err(AgentError::invalid_key(
                self.to_string(),
                "capability must be non-empty and contain neither '.' nor '/'",
            ));
        }
        if !self.path.is_absolute() {
            return Err(AgentError::invalid_key(self.to_string(), "path must be absolute"));
        }
        if self
            .path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(AgentError::invalid_key(
                self.to_string(),
                "path must not contain '.' or '..' components",
            ));
        }
        Ok(())
    }

    /// Path relative to the capability directory (leading separator stripped).
    fn relative(&self) -> PathBuf {
        self.path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.capability, self.path.display())
    }
}

impl FromStr for CacheKey {
    type Err = AgentError;

    /// Split on the first `.`: everything before it is the capability.
    fn from_str(s: &str) -> Result<Self> {
        let (capability, path) = s
            .split_once('.')
            .ok_or_else(|| AgentError::invalid_key(s, "missing '.' separator"))?;
        Self::new(capability, path)
    }
}

pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of an entry.
    pub fn location(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.capability).join(key.relative())
    }

    pub fn get(&self, capability: &str, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let key = CacheKey::new(capability, path.as_ref())?;
        self.get_key(&key)
    }

    pub fn get_key(&self, key: &CacheKey) -> Result<Vec<String>> {
        let content = fs::read_to_string(self.location(key)).map_err(|source| AgentError::Cache {
            key: key.to_string(),
            source,
        })?;
        Ok(content.lines().map(str::to_string).collect())
    }

    pub fn set<S: AsRef<str>>(
        &self,
        capability: &str,
        path: impl AsRef<Path>,
        lines: &[S],
    ) -> Result<()> {
        let key = CacheKey::new(capability, path.as_ref())?;
        let location = self.location(&key);
        info!(key = %key, "Staging cache entry");

        let write = || -> std::io::Result<()> {
            if let Some(parent) = location.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&location, join_lines(lines))
        };
        write().map_err(|source| AgentError::Cache {
            key: key.to_string(),
            source,
        })
    }

    pub fn delete(&self, capability: &str, path: impl AsRef<Path>) -> Result<()> {
        let key = CacheKey::new(capability, path.as_ref())?;
        match fs::remove_file(self.location(&key)) {
            Ok(()) => {
                debug!(key = %key, "Deleted cache entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AgentError::Cache {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Every entry currently staged, in path order.
    pub fn list(&self) -> Result<Vec<CacheKey>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(2).sort_by_file_name() {
            let entry = entry.map_err(|e| AgentError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let mut parts = relative.components();
            let Some(Component::Normal(capability)) = parts.next() else {
                continue;
            };
            let path = Path::new("/").join(parts.as_path());
            match CacheKey::new(capability.to_string_lossy(), path) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(entry = %entry.path().display(), error = %e, "Ignoring stray cache file"),
            }
        }
        Ok(keys)
    }

    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            for entry in fs::read_dir(&self.root)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        info!(root = %self.root.display(), "Cleared cache");
        Ok(())
    }
}

/// Lines joined with each one newline-terminated.
pub fn join_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    out
}
