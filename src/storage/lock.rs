//! Per-path advisory file lock with stale-lock reclaim.
//!
//! Grounds the session store's `withLock` semantics: `O_CREAT|O_EXCL`
//! acquire, 15 ms spin-retry up to a timeout, and reclaim of locks whose
//! mtime is older than a staleness threshold (crash recovery).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::GatewayError;

const POLL_INTERVAL: Duration = Duration::from_millis(15);

pub struct LockOptions {
    pub timeout_ms: u64,
    pub stale_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 600,
            stale_ms: 30_000,
        }
    }
}

/// A held lock file; unlinked on drop (best-effort — async cleanup happens
/// via `release`, which callers should prefer over relying on `Drop`).
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) {
        let _ = tokio::fs::remove_file(&self.path).await;
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Acquire an advisory lock at `lock_path`, reclaiming stale locks and
/// spin-retrying until `opts.timeout_ms` elapses.
pub async fn acquire(lock_path: &Path, opts: &LockOptions) -> Result<LockGuard> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(opts.timeout_ms);

    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
            .await
        {
            Ok(mut file) => {
                let payload = format!("{}:{}", std::process::id(), now_ms());
                file.write_all(payload.as_bytes()).await.ok();
                file.flush().await.ok();
                return Ok(LockGuard {
                    path: lock_path.to_path_buf(),
                    released: false,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if is_stale(lock_path, opts.stale_ms).await {
                    let _ = tokio::fs::remove_file(lock_path).await;
                    continue;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(GatewayError::LockConflict(
                        lock_path.display().to_string(),
                    )
                    .into());
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) => {
                return Err(e).context(format!("failed to create lock file {}", lock_path.display()))
            }
        }
    }
}

async fn is_stale(lock_path: &Path, stale_ms: u64) -> bool {
    let Ok(meta) = tokio::fs::metadata(lock_path).await else {
        // Lock disappeared between the EEXIST and this check — treat as gone.
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age.as_millis() as u64 > stale_ms,
        Err(_) => false,
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Run `body` while holding the lock at `lock_path`; always releases the
/// lock afterward, success or failure.
pub async fn with_lock<T, F, Fut>(lock_path: &Path, opts: &LockOptions, body: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let guard = acquire(lock_path, opts).await?;
    let result = body().await;
    guard.release().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn acquire_and_release_roundtrip() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("x.lock");
        let guard = acquire(&lock_path, &LockOptions::default()).await.unwrap();
        assert!(lock_path.exists());
        guard.release().await;
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_first_holds() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("x.lock");
        let _first = acquire(&lock_path, &LockOptions::default()).await.unwrap();
        let opts = LockOptions {
            timeout_ms: 80,
            stale_ms: 30_000,
        };
        let result = acquire(&lock_path, &opts).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("x.lock");
        tokio::fs::write(&lock_path, b"99999:0").await.unwrap();
        // Backdate the mtime far beyond the stale threshold.
        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        filetime_backdate(&lock_path, old);

        let opts = LockOptions {
            timeout_ms: 200,
            stale_ms: 1000,
        };
        let guard = acquire(&lock_path, &opts).await.unwrap();
        guard.release().await;
    }

    fn filetime_backdate(path: &Path, when: SystemTime) {
        let file = std::fs::File::open(path).unwrap();
        let _ = file.set_modified(when);
    }
}
