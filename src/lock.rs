//! Single-flight session lock.
//!
//! A sentinel file guards "an execution session is active". Acquisition
//! creates the sentinel with `create_new` before doing anything else, so two
//! concurrent dispatchers race on the filesystem, not on a check-then-act
//! gap. Liveness of a holder is probed by signal 0; a sentinel whose pid is
//! gone is stale and gets reclaimed. A sentinel that cannot be parsed is
//! treated as possibly active: better to skip a dispatch than to run two
//! agents against the same queue.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub created_at: DateTime<Utc>,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_count: Option<usize>,
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Acquired,
    /// Held by a live (or unverifiable) session. `pid` is `None` when the
    /// sentinel was unreadable.
    Busy { pid: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Try to take the lock for this process. Retries exactly once after
    /// reclaiming a stale sentinel.
    pub fn try_acquire(&self) -> Result<Acquisition> {
        for _ in 0..2 {
            match self.create_sentinel() {
                Ok(()) => return Ok(Acquisition::Acquired),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("Failed to create lock {}", self.path.display())
                    });
                }
            }

            let holder = match self.read() {
                Some(info) => info,
                None => return Ok(Acquisition::Busy { pid: None }),
            };
            if is_process_alive(holder.pid) {
                return Ok(Acquisition::Busy {
                    pid: Some(holder.pid),
                });
            }

            tracing::warn!("Removing stale session lock (pid {} not found)", holder.pid);
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("Failed to remove stale lock {}", self.path.display())
                    });
                }
            }
        }
        // Lost the post-reclaim race to another dispatcher.
        Ok(Acquisition::Busy {
            pid: self.read().map(|info| info.pid),
        })
    }

    /// Record how many tasks the session took. Best effort.
    pub fn update_task_count(&self, task_count: usize) {
        let info = LockInfo {
            created_at: self.read().map_or_else(Utc::now, |info| info.created_at),
            pid: std::process::id(),
            task_count: Some(task_count),
        };
        if let Err(err) = self.write(&info) {
            tracing::warn!("Could not update session lock: {err}");
        }
    }

    /// Drop the sentinel. Called once work has been handed off (or there
    /// was nothing to hand off); missing sentinel is fine.
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("Could not release session lock: {err}"),
        }
    }

    #[must_use]
    pub fn read(&self) -> Option<LockInfo> {
        let content = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn create_sentinel(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let info = LockInfo {
            created_at: Utc::now(),
            pid: std::process::id(),
            task_count: None,
        };
        let payload =
            serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(payload.as_bytes())
    }

    fn write(&self, info: &LockInfo) -> Result<()> {
        let payload = serde_json::to_string_pretty(info)?;
        fs::write(&self.path, payload)
            .with_context(|| format!("Failed to write lock {}", self.path.display()))
    }
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
pub fn is_process_alive(pid: u32) -> bool {
    let pid = i32::try_from(pid).unwrap_or(i32::MAX);
    // SAFETY: kill(pid, 0) only probes process existence and sends no signal.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // A pid that cannot belong to a live process.
    const DEAD_PID: u32 = u32::MAX;

    fn lock(root: &std::path::Path) -> SessionLock {
        SessionLock::new(root.join("session.lock"))
    }

    #[test]
    fn acquires_when_sentinel_absent() {
        let tmp = tempdir().expect("tempdir");
        let lock = lock(tmp.path());
        assert_eq!(lock.try_acquire().expect("acquire"), Acquisition::Acquired);

        let info = lock.read().expect("sentinel written");
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn busy_while_holder_is_alive() {
        let tmp = tempdir().expect("tempdir");
        let lock = lock(tmp.path());
        assert_eq!(lock.try_acquire().expect("first"), Acquisition::Acquired);

        // Same process holds it; the pid is alive, so a second attempt backs off.
        assert_eq!(
            lock.try_acquire().expect("second"),
            Acquisition::Busy {
                pid: Some(std::process::id())
            }
        );
    }

    #[test]
    fn reclaims_stale_sentinel() {
        let tmp = tempdir().expect("tempdir");
        let lock = lock(tmp.path());
        let stale = LockInfo {
            created_at: Utc::now(),
            pid: DEAD_PID,
            task_count: Some(3),
        };
        fs::write(
            tmp.path().join("session.lock"),
            serde_json::to_string(&stale).expect("serialize"),
        )
        .expect("write stale");

        assert_eq!(lock.try_acquire().expect("reclaim"), Acquisition::Acquired);
        assert_eq!(lock.read().expect("rewritten").pid, std::process::id());
    }

    #[test]
    fn unreadable_sentinel_counts_as_busy() {
        let tmp = tempdir().expect("tempdir");
        let lock = lock(tmp.path());
        fs::write(tmp.path().join("session.lock"), "not json at all").expect("write");

        assert_eq!(
            lock.try_acquire().expect("attempt"),
            Acquisition::Busy { pid: None }
        );
        // Sentinel untouched.
        assert!(tmp.path().join("session.lock").exists());
    }

    #[test]
    fn release_is_idempotent() {
        let tmp = tempdir().expect("tempdir");
        let lock = lock(tmp.path());
        assert_eq!(lock.try_acquire().expect("acquire"), Acquisition::Acquired);
        lock.release();
        lock.release();
        assert!(!tmp.path().join("session.lock").exists());
    }

    #[test]
    fn update_task_count_keeps_created_at() {
        let tmp = tempdir().expect("tempdir");
        let lock = lock(tmp.path());
        assert_eq!(lock.try_acquire().expect("acquire"), Acquisition::Acquired);
        let created = lock.read().expect("sentinel").created_at;

        lock.update_task_count(5);
        let info = lock.read().expect("sentinel");
        assert_eq!(info.task_count, Some(5));
        assert_eq!(info.created_at, created);
    }
}
