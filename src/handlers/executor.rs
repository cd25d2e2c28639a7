use crate::error::{AgentError, Result};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs the external programs handlers depend on.
pub struct CommandExecutor {
    program: PathBuf,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Resolve `name` through `$PATH` (or accept it as a path).
    pub fn locate(name: &str) -> Option<Self> {
        match which::which(name) {
            Ok(path) => {
                debug!(program = %name, path = %path.display(), "Resolved executable");
                Some(Self::new(path))
            }
            Err(e) => {
                debug!(program = %name, error = %e, "Executable not found");
                None
            }
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run with `stdin` fed to the child, capturing stdout/stderr.
    pub async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Output> {
        debug!(program = %self.program.display(), args = ?args, "Running command");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        debug!(
            program = %self.program.display(),
            code = ?output.status.code(),
            "Command finished"
        );
        Ok(output)
    }

    /// Like [`CommandExecutor::run`], but a non-zero exit is an error
    /// attributed to `handler`.
    pub async fn run_checked(
        &self,
        handler: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<Output> {
        let output = self.run(args, stdin).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                handler = %handler,
                program = %self.program.display(),
                code = ?output.status.code(),
                stderr = %stderr.trim(),
                "Command failed"
            );
            return Err(AgentError::handler(
                handler,
                format!(
                    "{} exited with {:?}",
                    self.program.display(),
                    output.status.code()
                ),
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let Some(cat) = CommandExecutor::locate("cat") else {
            return;
        };
        let output = cat.run(&[], Some(b"root:pw\n")).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"root:pw\n");
    }

    #[tokio::test]
    async fn test_run_checked_reports_failure() {
        let Some(falsy) = CommandExecutor::locate("false") else {
            return;
        };
        let err = falsy.run_checked("TestHandler", &[], None).await.unwrap_err();
        assert!(matches!(err, AgentError::Handler { .. }));
    }

    #[test]
    fn test_locate_missing_program() {
        assert!(CommandExecutor::locate("guestlink-definitely-missing").is_none());
    }
}
