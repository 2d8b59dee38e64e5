use std::fs;
use std::path::{Path, PathBuf};

use crate::bench_error::BenchError;
use crate::log_warn;

/// A lock guard that releases the workspace lock file on drop.
#[must_use = "lock is released when LockGuard is dropped"]
pub struct LockGuard {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Failed to release workspace lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            log_warn!(
                "Failed to remove PID file {}: {}",
                self.pid_path.display(),
                e
            );
        }
    }
}

/// Acquire exclusive ownership of a workspace directory.
///
/// The workspace protocol is not re-entrant; a second runner on the same
/// directory would interleave attempts. The file lock is the mutual
/// exclusion; the PID file exists for diagnostics when contention happens.
pub fn try_acquire(workspace: &Path) -> Result<LockGuard, BenchError> {
    fs::create_dir_all(workspace).map_err(|e| BenchError::workspace(workspace, e.to_string()))?;

    let lock_path = workspace.join(".phase-bench.lock");
    let pid_path = workspace.join(".phase-bench.pid");

    let mut lock = fslock::LockFile::open(&lock_path).map_err(|e| {
        BenchError::workspace(&lock_path, format!("Failed to open lock file: {}", e))
    })?;

    let acquired = lock.try_lock().map_err(|e| {
        BenchError::workspace(&lock_path, format!("Failed to acquire lock: {}", e))
    })?;

    if !acquired {
        let holder = fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());

        return Err(match holder {
            Some(pid) if is_pid_alive(pid) => BenchError::WorkspaceLocked(format!(
                "another runner owns {} (PID {})",
                workspace.display(),
                pid
            )),
            Some(pid) => BenchError::WorkspaceLocked(format!(
                "lock at {} is held but recorded PID {} is not alive; remove {} and {} to recover",
                workspace.display(),
                pid,
                lock_path.display(),
                pid_path.display()
            )),
            None => BenchError::WorkspaceLocked(format!(
                "another runner holds the lock on {}; if stale, remove {}",
                workspace.display(),
                lock_path.display()
            )),
        });
    }

    // We hold the lock, safe to write PID
    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| BenchError::workspace(&pid_path, format!("Failed to write PID file: {}", e)))?;

    Ok(LockGuard { lock, pid_path })
}

fn is_pid_alive(pid: i32) -> bool {
    // signal 0 checks if the process exists without sending a signal
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_pid_alive_current_process() {
        let pid = std::process::id() as i32;
        assert!(is_pid_alive(pid));
    }

    #[test]
    fn test_is_pid_alive_nonexistent() {
        assert!(!is_pid_alive(99_999_999));
    }
}
