use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::PathBuf;
use tracing::info;

use crate::error::{AgentError, Result};
use crate::handler::{Handler, Output};
use crate::record::ConfigurationRecord;

/// Injects a file: `arguments` is base64 of `"<absolute path>,<content>"`.
#[derive(Default)]
pub struct FileHandler;

fn decode_injection(encoded: &str) -> Result<(PathBuf, Vec<String>)> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AgentError::handler("FileHandler", format!("invalid base64: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| AgentError::handler("FileHandler", "payload is not UTF-8"))?;
    let (path, content) = text
        .split_once(',')
        .ok_or_else(|| AgentError::handler("FileHandler", "payload lacks a ',' separator"))?;

    let path = PathBuf::from(path.trim());
    if !path.is_absolute() {
        return Err(AgentError::handler(
            "FileHandler",
            format!("'{}' is not an absolute path", path.display()),
        ));
    }

    let body = content.strip_suffix('\n').unwrap_or(content);
    let lines = if content.is_empty() {
        Vec::new()
    } else {
        body.split('\n').map(str::to_string).collect()
    };
    Ok((path, lines))
}

#[async_trait]
impl Handler for FileHandler {
    fn name(&self) -> &str {
        "FileHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        if record.function != "file" {
            info!("Must be passed \"file\" as the function");
            return false;
        }
        if record.arguments.is_none() {
            info!("Must be passed an argument in the message");
            return false;
        }
        true
    }

    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let encoded = record
            .arguments
            .as_deref()
            .ok_or_else(|| AgentError::handler(self.name(), "no arguments"))?;
        let (path, lines) = decode_injection(encoded)?;
        info!(path = %path.display(), lines = lines.len(), "Injecting file");
        Ok(vec![Output::File { path, lines }])
    }
}
