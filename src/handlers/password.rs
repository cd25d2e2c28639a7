use async_trait::async_trait;
use tracing::info;

use super::executor::CommandExecutor;
use crate::error::{AgentError, Result};
use crate::handler::{is_root, Handler, Output};
use crate::record::ConfigurationRecord;

/// Sets the root password through `chpasswd`.
pub struct PasswordHandler {
    user: String,
    chpasswd: Option<CommandExecutor>,
}

impl PasswordHandler {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            chpasswd: None,
        }
    }
}

impl Default for PasswordHandler {
    fn default() -> Self {
        Self::new("root")
    }
}

/// The line `chpasswd` reads on stdin.
fn chpasswd_line(user: &str, password: &str) -> String {
    format!("{}:{}\n", user, password)
}

#[async_trait]
impl Handler for PasswordHandler {
    fn name(&self) -> &str {
        "PasswordHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        if record.password.is_none() {
            info!("Must be passed a password in the message");
            return false;
        }
        if !is_root() {
            info!("Changing passwords requires uid 0");
            return false;
        }
        if self.chpasswd.is_none() {
            self.chpasswd = CommandExecutor::locate("chpasswd");
        }
        if self.chpasswd.is_none() {
            info!("Must have access to chpasswd");
            return false;
        }
        true
    }

    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let password = record
            .password
            .as_deref()
            .ok_or_else(|| AgentError::handler("PasswordHandler", "no password"))?;
        let chpasswd = self
            .chpasswd
            .as_ref()
            .ok_or_else(|| AgentError::handler("PasswordHandler", "chpasswd not resolved"))?;

        let line = chpasswd_line(&self.user, password);
        chpasswd
            .run_checked("PasswordHandler", &[], Some(line.as_bytes()))
            .await?;
        info!(user = %self.user, "Password updated");
        Ok(Vec::new())
    }
}
