//! Cross-context serialization of silent refresh attempts
//!
//! All callers sharing an origin ultimately share one session, so a single
//! well-known lock serializes every silent refresh regardless of audience.
//! The lock must hold across independent contexts (processes), not merely
//! within one, so the provided implementation signals through shared
//! storage: atomic creation of a lock file, polled by waiters, with a
//! staleness takeover so a crashed holder cannot deadlock the origin.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// The single well-known lock name used for the whole silent-refresh path
pub const REFRESH_LOCK_NAME: &str = "aliri_silent.get_token_silently";

/// The lock was not acquired within its deadline
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Error)]
#[error("timed out waiting for the silent authentication lock")]
pub struct LockTimeoutError;

/// A mutex shared across same-origin contexts
#[async_trait]
pub trait AsyncRefreshLock: Send + Sync {
    /// Blocks the caller (without blocking the thread) until the lock is
    /// obtained or `timeout` elapses
    async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockTimeoutError>;
}

/// Ownership of the silent-refresh mutex
///
/// Dropping the guard releases the lock, so release happens exactly once on
/// every exit path, including early returns and panics.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// Constructs a guard that runs `release` when dropped
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockGuard").finish()
    }
}

/// A refresh lock backed by a file in storage shared between contexts
#[derive(Clone, Debug)]
pub struct FileRefreshLock {
    path: PathBuf,
    poll_interval: Duration,
    stale_after: Duration,
}

impl FileRefreshLock {
    /// Constructs a lock rooted in the given shared directory
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.lock", REFRESH_LOCK_NAME)),
            poll_interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(30),
        }
    }

    /// Sets how often waiters re-check the lock
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the age after which an abandoned lock may be taken over
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    async fn try_take(&self, owner: &str) -> Option<LockGuard> {
        let mut open = tokio::fs::OpenOptions::new();
        open.write(true).create_new(true);

        match open.open(&self.path).await {
            Ok(mut file) => {
                if let Err(error) = file.write_all(owner.as_bytes()).await {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "unable to record lock ownership"
                    );
                }
                let path = self.path.clone();
                let owner = owner.to_owned();
                Some(LockGuard::new(move || release_file_lock(&path, &owner)))
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                self.take_over_if_stale().await;
                None
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    path = %self.path.display(),
                    "unable to create lock file"
                );
                None
            }
        }
    }

    async fn take_over_if_stale(&self) {
        let age = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok()),
            Err(_) => None,
        };

        if let Some(age) = age {
            if age > self.stale_after {
                tracing::warn!(
                    age_ms = age.as_millis() as u64,
                    "taking over a stale silent authentication lock"
                );
                let _ = tokio::fs::remove_file(&self.path).await;
            }
        }
    }
}

#[async_trait]
impl AsyncRefreshLock for FileRefreshLock {
    async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockTimeoutError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let owner = format!("{:016x}", rand::random::<u64>());

        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        loop {
            if let Some(guard) = self.try_take(&owner).await {
                tracing::debug!("acquired the silent authentication lock");
                return Ok(guard);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!("gave up waiting for the silent authentication lock");
                return Err(LockTimeoutError);
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }
}

fn release_file_lock(path: &Path, owner: &str) {
    match std::fs::read_to_string(path) {
        Ok(contents) if contents == owner => {
            if let Err(error) = std::fs::remove_file(path) {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "unable to release lock file"
                );
            }
        }
        // Taken over by another context; the lock is no longer ours to release.
        Ok(_) => {}
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_lock(dir: &Path) -> FileRefreshLock {
        FileRefreshLock::new(dir).with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn acquire_creates_and_release_removes_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = quick_lock(dir.path());

        let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(dir.path().join(format!("{}.lock", REFRESH_LOCK_NAME)).exists());

        drop(guard);
        assert!(!dir.path().join(format!("{}.lock", REFRESH_LOCK_NAME)).exists());
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = quick_lock(dir.path());

        let _guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
        let err = lock.acquire(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, LockTimeoutError);
    }

    #[tokio::test]
    async fn second_acquire_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = quick_lock(dir.path());

        let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
        drop(guard);
        let _again = lock.acquire(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn a_waiter_obtains_the_lock_once_the_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock = quick_lock(dir.path());

        let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();

        let contender = lock.clone();
        let waiter =
            tokio::spawn(async move { contender.acquire(Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn abandoned_locks_are_taken_over_after_the_stale_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{}.lock", REFRESH_LOCK_NAME));
        std::fs::write(&path, "dead-context").unwrap();

        let lock = quick_lock(dir.path()).with_stale_after(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
    }
}
