use crate::shared::errors::PipelineError;
use crate::shared::ids::validate_stem;
use crate::shared::time::now_rfc3339;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Two-level stem lock. The in-process table serializes threads of this
/// process; the `.locks/<stem>.lock` file serializes against any other
/// process sharing the vault. A lock file older than `stale_ms` is
/// presumed abandoned and claimed.
pub struct StemLocks {
    locks_dir: PathBuf,
    stale_ms: u64,
    held: Mutex<BTreeSet<String>>,
    released: Condvar,
}

pub struct StemLockGuard<'a> {
    locks: &'a StemLocks,
    stem: String,
    /// True when acquisition had to claim an abandoned lock file; callers
    /// audit this as `lock.stale`.
    pub stale_claimed: bool,
}

impl StemLocks {
    pub fn new(locks_dir: impl Into<PathBuf>, stale_ms: u64) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            stale_ms,
            held: Mutex::new(BTreeSet::new()),
            released: Condvar::new(),
        }
    }

    fn lock_file_path(&self, stem: &str) -> PathBuf {
        self.locks_dir.join(format!("{stem}.lock"))
    }

    pub fn acquire(&self, stem: &str, timeout: Duration) -> Result<StemLockGuard<'_>, PipelineError> {
        validate_stem(stem).map_err(|_| PipelineError::LockTimeout {
            stem: stem.to_string(),
            waited_ms: 0,
        })?;
        let deadline = Instant::now() + timeout;

        {
            let mut held = self.held.lock().expect("stem lock table");
            while held.contains(stem) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(PipelineError::LockTimeout {
                        stem: stem.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                let (guard, _timeout) = self
                    .released
                    .wait_timeout(held, remaining)
                    .expect("stem lock wait");
                held = guard;
            }
            held.insert(stem.to_string());
        }

        let mut stale_claimed = false;
        loop {
            match self.try_create_lock_file(stem) {
                Ok(()) => break,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_file_is_stale(stem) {
                        let _ = fs::remove_file(self.lock_file_path(stem));
                        stale_claimed = true;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        self.release_in_process(stem);
                        return Err(PipelineError::LockTimeout {
                            stem: stem.to_string(),
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(_) => {
                    // Treat an unwritable lock directory the same as
                    // contention; the transition will surface the cause.
                    self.release_in_process(stem);
                    return Err(PipelineError::LockTimeout {
                        stem: stem.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }

        Ok(StemLockGuard {
            locks: self,
            stem: stem.to_string(),
            stale_claimed,
        })
    }

    fn try_create_lock_file(&self, stem: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.locks_dir)?;
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.lock_file_path(stem))?;
        write!(file, "{}\n{}", std::process::id(), now_rfc3339())
    }

    fn lock_file_is_stale(&self, stem: &str) -> bool {
        let path = self.lock_file_path(stem);
        let Ok(metadata) = fs::metadata(&path) else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age >= Duration::from_millis(self.stale_ms))
            .unwrap_or(false)
    }

    fn release_in_process(&self, stem: &str) {
        let mut held = self.held.lock().expect("stem lock table");
        held.remove(stem);
        self.released.notify_all();
    }

    pub fn is_held(&self, stem: &str) -> bool {
        self.held.lock().expect("stem lock table").contains(stem)
    }

    /// Removes lock files older than the stale threshold. Run at startup.
    pub fn cleanup_stale_files(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.locks_dir) else {
            return 0;
        };
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some("lock") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|v| v.to_str()) else {
                continue;
            };
            if self.lock_file_is_stale(stem) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

impl Drop for StemLockGuard<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.locks.lock_file_path(&self.stem));
        self.locks.release_in_process(&self.stem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_and_release_removes_lock_file() {
        let dir = tempdir().expect("tempdir");
        let locks = StemLocks::new(dir.path().join(".locks"), 300_000);
        {
            let guard = locks
                .acquire("stem-1", Duration::from_millis(500))
                .expect("acquire");
            assert!(!guard.stale_claimed);
            assert!(dir.path().join(".locks/stem-1.lock").is_file());
            assert!(locks.is_held("stem-1"));
        }
        assert!(!dir.path().join(".locks/stem-1.lock").exists());
        assert!(!locks.is_held("stem-1"));
    }

    #[test]
    fn second_acquirer_times_out_while_first_holds() {
        let dir = tempdir().expect("tempdir");
        let locks = Arc::new(StemLocks::new(dir.path().join(".locks"), 300_000));
        let guard = locks
            .acquire("stem-1", Duration::from_millis(500))
            .expect("first acquire");

        let contender = Arc::clone(&locks);
        let result = thread::spawn(move || {
            contender
                .acquire("stem-1", Duration::from_millis(150))
                .map(|_| ())
        })
        .join()
        .expect("join");
        assert!(matches!(result, Err(PipelineError::LockTimeout { .. })));
        drop(guard);

        locks
            .acquire("stem-1", Duration::from_millis(500))
            .expect("acquire after release");
    }

    #[test]
    fn stale_lock_file_is_claimed() {
        let dir = tempdir().expect("tempdir");
        let locks_dir = dir.path().join(".locks");
        fs::create_dir_all(&locks_dir).expect("mkdir");
        fs::write(locks_dir.join("stem-1.lock"), b"12345").expect("seed stale lock");

        let locks = StemLocks::new(&locks_dir, 0);
        let guard = locks
            .acquire("stem-1", Duration::from_millis(500))
            .expect("acquire");
        assert!(guard.stale_claimed);
    }

    #[test]
    fn foreign_fresh_lock_file_blocks_until_timeout() {
        let dir = tempdir().expect("tempdir");
        let locks_dir = dir.path().join(".locks");
        fs::create_dir_all(&locks_dir).expect("mkdir");
        fs::write(locks_dir.join("stem-1.lock"), b"99999").expect("seed foreign lock");

        let locks = StemLocks::new(&locks_dir, 300_000);
        let result = locks.acquire("stem-1", Duration::from_millis(120));
        assert!(matches!(result, Err(PipelineError::LockTimeout { .. })));
        assert!(!locks.is_held("stem-1"), "reservation must be rolled back");
    }
}
