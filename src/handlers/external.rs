use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::executor::CommandExecutor;
use crate::error::{AgentError, Result};
use crate::handler::{capability_from_name, Handler, Output, MESSAGE_KEY};
use crate::record::{CapabilitySet, ConfigurationRecord};

#[derive(Debug, Clone, Deserialize)]
pub struct HandlerManifest {
    pub handler: ManifestEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Record fields that must carry a value
    #[serde(default)]
    pub requires: Vec<String>,
}

impl HandlerManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Self = toml::from_str(&content)?;
        if manifest.handler.name.trim().is_empty() {
            return Err(AgentError::Config(format!(
                "{}: handler name is empty",
                path.display()
            )));
        }
        Ok(manifest)
    }
}

pub struct ExternalHandler {
    entry: ManifestEntry,
    source: PathBuf,
    executor: Option<CommandExecutor>,
}

impl ExternalHandler {
    pub fn new(manifest: HandlerManifest, source: impl Into<PathBuf>) -> Self {
        Self {
            entry: manifest.handler,
            source: source.into(),
            executor: None,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Turn the program's stdout into outputs.
pub fn parse_outputs(handler: &str, stdout: &[u8]) -> Result<Vec<Output>> {
    let text = std::str::from_utf8(stdout)
        .map_err(|_| AgentError::handler(handler, "output is not UTF-8"))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let map: BTreeMap<String, Value> = serde_json::from_str(text)
        .map_err(|e| AgentError::handler(handler, format!("output is not a JSON object: {}", e)))?;

    let mut outputs = Vec::with_capacity(map.len());
    for (key, value) in map {
        let lines: Vec<String> = match value {
            Value::String(s) => s.lines().map(str::to_string).collect(),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            other => {
                return Err(AgentError::handler(
                    handler,
                    format!("value for '{}' must be a string or array, got {}", key, other),
                ))
            }
        };

        if key == MESSAGE_KEY {
            outputs.push(Output::Message(lines.join("\n")));
        } else {
            let path = PathBuf::from(&key);
            if !path.is_absolute() {
                return Err(AgentError::handler(
                    handler,
                    format!("output key '{}' is neither a path nor \"message\"", key),
                ));
            }
            outputs.push(Output::File { path, lines });
        }
    }
    Ok(outputs)
}

#[async_trait]
impl Handler for ExternalHandler {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn capabilities(&self) -> CapabilitySet {
        match &self.entry.capabilities {
            Some(caps) if !caps.is_empty() => caps.iter().cloned().collect(),
            _ => CapabilitySet::from([capability_from_name(&self.entry.name)]),
        }
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        if let Some(missing) = self.entry.requires.iter().find(|f| !record.has(f)) {
            info!(handler = %self.entry.name, field = %missing, "Required field missing");
            return false;
        }
        if self.executor.is_none() {
            self.executor = CommandExecutor::locate(&self.entry.command);
        }
        if self.executor.is_none() {
            warn!(handler = %self.entry.name, command = %self.entry.command, "Command not found");
            return false;
        }
        true
    }

    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| AgentError::handler(&self.entry.name, "command not resolved"))?;
        let input = serde_json::to_vec(record)?;
        let output = executor
            .run_checked(&self.entry.name, &self.entry.args, Some(&input))
            .await?;
        debug!(handler = %self.entry.name, bytes = output.stdout.len(), "External handler replied");
        parse_outputs(&self.entry.name, &output.stdout)
    }
}
