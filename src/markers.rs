//! Session-marker signals for other same-origin contexts
//!
//! After a successful silent exchange, two boolean markers are written to a
//! shared store so that other contexts can infer "a session may exist"
//! without ever seeing a token. The legacy key name is kept alongside the
//! current one for stores written by earlier releases. Writes are
//! best-effort and never fail the token request.

use std::path::PathBuf;

use aliri_clock::{Clock, System, UnixTime};
use async_trait::async_trait;

/// The current session marker key
pub const SESSION_MARKER_KEY: &str = "aliri.is.authenticated";

/// The session marker key written by earlier releases
pub const LEGACY_SESSION_MARKER_KEY: &str = "_legacy_aliri.is.authenticated";

type MarkerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A store for session markers readable by other same-origin contexts
#[async_trait]
pub trait AsyncSessionMarkerStore: Send + Sync {
    /// Records that a session exists under `key`, expiring after
    /// `expiry_days` days
    async fn set(&self, key: &str, expiry_days: u32) -> Result<(), MarkerError>;
}

/// A marker store that records nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSessionMarkerStore;

#[async_trait]
impl AsyncSessionMarkerStore for NoopSessionMarkerStore {
    async fn set(&self, _key: &str, _expiry_days: u32) -> Result<(), MarkerError> {
        Ok(())
    }
}

/// A marker store backed by files in storage shared between contexts
///
/// Each marker is a file named by its key whose contents are the expiry
/// instant in Unix time.
#[derive(Clone, Debug)]
pub struct FileSessionMarkerStore {
    dir: PathBuf,
}

impl FileSessionMarkerStore {
    /// Constructs a store rooted in the given shared directory
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Reads a marker, returning whether it exists and has not expired
    pub async fn is_set(&self, key: &str) -> bool {
        match tokio::fs::read_to_string(self.dir.join(key)).await {
            Ok(contents) => contents
                .trim()
                .parse::<u64>()
                .map(|expiry| System.now() < UnixTime(expiry))
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl AsyncSessionMarkerStore for FileSessionMarkerStore {
    async fn set(&self, key: &str, expiry_days: u32) -> Result<(), MarkerError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let expiry = System.now() + aliri_clock::DurationSecs(u64::from(expiry_days) * 86_400);
        tokio::fs::write(self.dir.join(key), expiry.0.to_string()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_written_marker_is_visible_until_it_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionMarkerStore::new(dir.path().to_owned());

        assert!(!store.is_set(SESSION_MARKER_KEY).await);
        store.set(SESSION_MARKER_KEY, 1).await.unwrap();
        assert!(store.is_set(SESSION_MARKER_KEY).await);
    }

    #[tokio::test]
    async fn markers_are_readable_by_another_store_over_the_same_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileSessionMarkerStore::new(dir.path().to_owned());
        let reader = FileSessionMarkerStore::new(dir.path().to_owned());

        writer.set(LEGACY_SESSION_MARKER_KEY, 2).await.unwrap();
        assert!(reader.is_set(LEGACY_SESSION_MARKER_KEY).await);
    }
}
