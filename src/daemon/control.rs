use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info};

use super::pidfile::{is_process_running, read_pid};
use crate::error::{AgentError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(i32),
    /// The pidfile names a process that is gone.
    Stale(i32),
    Stopped,
}

impl DaemonStatus {
    pub fn pid(&self) -> Option<i32> {
        match self {
            DaemonStatus::Running(pid) => Some(*pid),
            _ => None,
        }
    }
}

pub fn status(pidfile: &Path) -> DaemonStatus {
    match read_pid(pidfile) {
        Some(pid) if is_process_running(pid) => DaemonStatus::Running(pid),
        Some(pid) => DaemonStatus::Stale(pid),
        None => DaemonStatus::Stopped,
    }
}

/// Deliver `signal` to `pid`.
pub fn send_signal(pid: i32, signal: libc::c_int) -> Result<()> {
    debug!(pid, signal, "Signalling daemon");
    // SAFETY: plain syscall with no memory arguments.
    let result = unsafe { libc::kill(pid, signal) };
    if result != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Signal the daemon named by `pidfile`. Returns the pid, or `None` when no
/// daemon is running.
pub fn signal_daemon(pidfile: &Path, signal: libc::c_int) -> Result<Option<i32>> {
    match status(pidfile) {
        DaemonStatus::Running(pid) => {
            send_signal(pid, signal)?;
            Ok(Some(pid))
        }
        _ => Ok(None),
    }
}

/// Poll until `pid` exits. False on timeout.
pub async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while is_process_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    true
}

/// Poll until a live daemon has written `pidfile`.
pub async fn wait_for_pidfile(pidfile: &Path, timeout: Duration) -> Option<i32> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let DaemonStatus::Running(pid) = status(pidfile) {
            return Some(pid);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Start `<current exe> <args>` detached in its own process group.
pub fn spawn_detached(args: &[String]) -> Result<u32> {
    use std::os::unix::process::CommandExt;

    let exe: PathBuf = std::env::current_exe()
        .map_err(|e| AgentError::Other(format!("Failed to get exe path: {}", e)))?;

    let child = std::process::Command::new(&exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;

    info!(pid = child.id(), exe = %exe.display(), "Spawned daemon");
    Ok(child.id())
}
