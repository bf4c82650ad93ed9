use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Another process holds the lock and the acquisition timeout elapsed.
/// Hooks downcast to this to exit silently instead of failing the host.
#[derive(Debug)]
pub struct LockContended {
    pub path: PathBuf,
}

impl std::fmt::Display for LockContended {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock contended: {}", self.path.display())
    }
}

impl std::error::Error for LockContended {}

/// Exclusive advisory lock on `<path>.lock`, released on drop.
///
/// The lock file itself is never removed — deleting it would race with a
/// concurrent acquirer that already opened the old inode.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire with the given timeout, polling the OS advisory lock.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<FileLock> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("creating lock directory")?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.display()))?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(FileLock {
                        file,
                        path: lock_path,
                    })
                }
                Err(_) if Instant::now() < deadline => std::thread::sleep(RETRY_INTERVAL),
                Err(_) => {
                    return Err(anyhow::Error::new(LockContended {
                        path: lock_path.clone(),
                    }))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".lock");
    target.with_file_name(name)
}

/// True when `err` is a lock-contention failure.
pub fn is_contended(err: &anyhow::Error) -> bool {
    err.is::<LockContended>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("LESSONS.md");
        {
            let guard = FileLock::acquire(&target, Duration::from_secs(1)).unwrap();
            assert!(guard.path().ends_with("LESSONS.md.lock"));
        }
        // Released on drop — immediate reacquisition succeeds.
        FileLock::acquire(&target, Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("LESSONS.md");
        let _held = FileLock::acquire(&target, Duration::from_secs(1)).unwrap();
        let err = FileLock::acquire(&target, Duration::from_millis(120)).unwrap_err();
        assert!(is_contended(&err));
    }

    #[test]
    fn stale_lock_file_is_acquirable() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("HANDOFFS.md");
        std::fs::write(lock_path_for(&target), "").unwrap();
        FileLock::acquire(&target, Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn lock_file_survives_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("LESSONS.md");
        let lock_path = {
            let guard = FileLock::acquire(&target, Duration::from_secs(1)).unwrap();
            guard.path().to_path_buf()
        };
        assert!(lock_path.exists());
    }
}
