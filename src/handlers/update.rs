use async_trait::async_trait;
use tracing::info;

use super::executor::CommandExecutor;
use crate::error::{AgentError, Result};
use crate::handler::{is_root, Handler, Output};
use crate::record::ConfigurationRecord;

/// Runs the operator-configured agent update command.
pub struct UpdateHandler {
    command: Vec<String>,
    executor: Option<CommandExecutor>,
}

impl UpdateHandler {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            executor: None,
        }
    }
}

#[async_trait]
impl Handler for UpdateHandler {
    fn name(&self) -> &str {
        "UpdateHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        if record.function != "update" {
            info!("Must be passed \"update\" as the function");
            return false;
        }
        if !is_root() {
            info!("Updating requires uid 0");
            return false;
        }
        let Some(program) = self.command.first() else {
            info!("No update command configured");
            return false;
        };
        if self.executor.is_none() {
            self.executor = CommandExecutor::locate(program);
        }
        self.executor.is_some()
    }

    async fn produce(&mut self, _record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| AgentError::handler("UpdateHandler", "update command not resolved"))?;
        let args = self.command.get(1..).unwrap_or_default();
        executor.run_checked("UpdateHandler", args, None).await?;
        info!(program = %executor.program().display(), "Update finished");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_update_function() {
        let mut handler = UpdateHandler::new(vec!["true".into()]);
        assert!(!handler.is_runnable(&ConfigurationRecord::new("file")));
    }

    #[test]
    fn test_empty_command_never_runnable() {
        let mut handler = UpdateHandler::new(Vec::new());
        let record = ConfigurationRecord::new("update");
        assert!(!handler.is_runnable(&record));
    }
}
