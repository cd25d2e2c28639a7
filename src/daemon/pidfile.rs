use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Holds an advisory `flock` on the pidfile; dropping it releases the lock
/// and removes the file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    _file: File,
}

impl PidFile {
    /// Lock `path` without blocking and record our pid in it.
    ///
    /// Fails with [`AgentError::AlreadyRunning`] when another process holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Not truncated until the lock is ours, so a loser can still read the
        // winner's pid.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                let mut content = String::new();
                let _ = file.read_to_string(&mut content);
                return Err(AgentError::AlreadyRunning {
                    pid: content.trim().parse().ok(),
                    path,
                });
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        info!("PID file written: {}", path.display());
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Could not remove pidfile");
        } else {
            debug!(path = %self.path.display(), "Released pidfile");
        }
    }
}

/// Pid recorded in `path`, if any.
pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|pid| *pid > 0)
}

/// Whether a process with `pid` exists.
pub fn is_process_running(pid: i32) -> bool {
    // SAFETY: signal 0 performs error checking only.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/guestlink.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));
        assert!(is_process_running(std::process::id() as i32));

        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guestlink.pid");

        let _held = PidFile::acquire(&path).unwrap();
        match PidFile::acquire(&path) {
            Err(AgentError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id() as i32))
            }
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        // The holder's pid survives the failed attempt.
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));
    }

    #[test]
    fn test_read_pid_missing_or_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");
        assert_eq!(read_pid(&path), None);
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid(&path), None);
    }
}
