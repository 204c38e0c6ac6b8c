//! Keyed storage of issued token sets with expiry bookkeeping
//!
//! Entries are keyed by a fingerprint of `(client id, audience, scope)`.
//! Scope is a set, so requests differing only in token order or duplicates
//! resolve to the same entry. An entry within [`CACHE_LEEWAY`] of its expiry
//! is treated as a miss even though not technically expired, forcing early
//! renewal ahead of clock skew and in-flight latency.
//!
//! Lookups never touch the network. Writes merge with any existing entry
//! for the fingerprint: scopes union (a write never narrows previously
//! granted scope) and a stored refresh token survives unless the authority
//! rotated it. Failed refresh attempts never modify the cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use aliri::jwt;
use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::validate::IdTokenClaims;
use crate::{AccessToken, ClientId, IdToken, RefreshToken, Scope, TokenSet};

/// Safety margin under which a live entry is treated as a cache miss
pub const CACHE_LEEWAY: DurationSecs = DurationSecs(60);

/// The audience recorded when a caller does not name one
pub const DEFAULT_AUDIENCE: &str = "default";

type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The derived key identifying one cached token set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    client_id: ClientId,
    audience: jwt::Audience,
    scope: Scope,
}

impl Fingerprint {
    /// Derives the fingerprint for a request
    ///
    /// An absent audience maps to the fixed [`DEFAULT_AUDIENCE`] value so
    /// that "no audience" requests share one entry.
    pub fn new(client_id: ClientId, audience: Option<jwt::Audience>, scope: Scope) -> Self {
        Self {
            client_id,
            audience: audience.unwrap_or_else(|| jwt::Audience::new(DEFAULT_AUDIENCE.to_owned())),
            scope,
        }
    }

    /// The client ID component of the key
    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The audience component of the key
    #[inline]
    pub fn audience(&self) -> &jwt::Audience {
        &self.audience
    }

    /// The normalized scope component of the key
    #[inline]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Renders the storage key; scope appears in canonical order, so two
    /// fingerprints that compare equal render identically
    pub fn cache_key(&self) -> String {
        format!("{}::{}::{}", self.client_id, self.audience, self.scope)
    }
}

/// One cached token set
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The client the tokens were issued to
    pub client_id: ClientId,
    /// The audience the tokens were issued for
    pub audience: jwt::Audience,
    /// The granted scope
    pub scope: Scope,
    /// The access token; absent for refresh-only entries
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    /// The identity token, if one was issued
    #[serde(default)]
    pub id_token: Option<IdToken>,
    /// The refresh token, present only when issuance is enabled and the
    /// exchange is not routed through the isolated worker
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    /// The lifetime reported by the authority
    pub lifetime: DurationSecs,
    /// When the tokens were issued
    pub issued: UnixTime,
    /// When the access token expires
    pub expiry: UnixTime,
    /// Decoded identity token claims
    #[serde(default)]
    pub claims: Option<IdTokenClaims>,
}

impl CacheEntry {
    /// Whether the entry can satisfy a request at `time` without network
    /// access
    pub fn usable_at(&self, time: UnixTime, leeway: DurationSecs) -> bool {
        self.access_token.is_some() && time + leeway < self.expiry
    }

    /// Converts the entry into a caller-facing token set
    ///
    /// Returns `None` for refresh-only entries; the refresh token itself is
    /// never part of the result.
    pub fn into_token_set(self) -> Option<TokenSet> {
        let access_token = self.access_token?;
        Some(TokenSet::new(
            access_token,
            self.id_token,
            self.scope,
            self.audience,
            self.lifetime,
            self.issued,
            self.claims,
        ))
    }
}

/// Pluggable backing storage for cached token sets
#[async_trait]
pub trait AsyncCacheBackend: Send + Sync {
    /// Reads the entry stored under `key`
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError>;

    /// Stores `entry` under `key`, replacing any existing entry
    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), BackendError>;

    /// Removes the entry stored under `key`
    async fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// Removes every entry
    async fn clear(&self) -> Result<(), BackendError>;

    /// Whether entries outlive the process in plaintext storage
    ///
    /// Persistent backends already expose any stored refresh token to the
    /// host environment, which disables the isolated exchange worker:
    /// isolating a secret that is readable elsewhere buys nothing.
    fn is_persistent(&self) -> bool;
}

/// An in-memory cache backend
#[derive(Default, Debug)]
pub struct InMemoryCacheBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCacheBackend {
    /// Constructs an empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AsyncCacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), BackendError> {
        self.lock().insert(key.to_owned(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.lock().clear();
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// A cache backend persisted as a JSON file
///
/// Writes on the silent path happen under the cross-context refresh lock,
/// which keeps the read-modify-write below safe between cooperating
/// contexts.
#[derive(Debug)]
pub struct FileCacheBackend {
    path: PathBuf,
}

impl FileCacheBackend {
    /// Constructs a backend storing entries at the given path
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_all(&self) -> Result<HashMap<String, CacheEntry>, BackendError> {
        use tokio::io::AsyncReadExt;

        let mut file = match tokio::fs::OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new())
            }
            Err(error) => return Err(error.into()),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn write_all(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), BackendError> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = tokio::fs::OpenOptions::new();
        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(entries)?;
        file.write_all(data.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl AsyncCacheBackend for FileCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        let mut entries = self.read_all().await?;
        Ok(entries.remove(key))
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), BackendError> {
        let mut entries = self.read_all().await?;
        entries.insert(key.to_owned(), entry.clone());
        self.write_all(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// The token cache: key derivation, leeway policy, merge-on-write
#[derive(Clone)]
pub struct TokenCache<C = System> {
    backend: Arc<dyn AsyncCacheBackend>,
    leeway: DurationSecs,
    clock: C,
}

impl TokenCache {
    /// Constructs a cache over the given backend with the default leeway
    pub fn new(backend: Arc<dyn AsyncCacheBackend>) -> Self {
        Self {
            backend,
            leeway: CACHE_LEEWAY,
            clock: System,
        }
    }
}

impl<C> TokenCache<C> {
    /// Sets a custom leeway
    pub fn with_leeway(mut self, leeway: DurationSecs) -> Self {
        self.leeway = leeway;
        self
    }

    /// Sets a custom clock
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenCache<D> {
        TokenCache {
            backend: self.backend,
            leeway: self.leeway,
            clock,
        }
    }

    /// Whether the backing store keeps entries in plaintext beyond the
    /// process lifetime
    pub fn is_persistent(&self) -> bool {
        self.backend.is_persistent()
    }
}

impl<C: Clock + Send + Sync> TokenCache<C> {
    /// Reads the raw entry for a fingerprint, ignoring the leeway policy
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        match self.backend.get(&fingerprint.cache_key()).await {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn std::error::Error),
                    "token cache backend returned error, treating as a miss"
                );
                None
            }
        }
    }

    /// Reads the entry for a fingerprint if it can satisfy a request now
    /// without network access
    pub async fn get_usable(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.get(fingerprint).await?;
        let now = self.clock.now();
        if entry.usable_at(now, self.leeway) {
            tracing::debug!(expiry = entry.expiry.0, "token cache hit");
            Some(entry)
        } else {
            tracing::debug!(
                expiry = entry.expiry.0,
                now = now.0,
                leeway = self.leeway.0,
                "cached token is absent or within the leeway window, treating as a miss"
            );
            None
        }
    }

    /// Merge-writes a new entry for a fingerprint
    ///
    /// The stored scope is the union of the new and any previously granted
    /// scope, and a previously stored refresh token survives unless this
    /// write rotates it. Only successful exchanges reach this point, so a
    /// live entry is never clobbered by a failure.
    pub async fn save(&self, fingerprint: &Fingerprint, mut entry: CacheEntry) {
        if let Some(existing) = self.get(fingerprint).await {
            entry.scope = entry.scope.union(&existing.scope);
            if entry.refresh_token.is_none() {
                entry.refresh_token = existing.refresh_token;
            }
        }

        if let Err(error) = self.backend.put(&fingerprint.cache_key(), &entry).await {
            tracing::warn!(
                error = (&*error as &dyn std::error::Error),
                "unable to persist token to cache"
            );
        }
    }

    /// Clears one entry, or every entry when no fingerprint is given
    pub async fn clear(&self, fingerprint: Option<&Fingerprint>) {
        let result = match fingerprint {
            Some(fingerprint) => self.backend.remove(&fingerprint.cache_key()).await,
            None => self.backend.clear().await,
        };

        if let Err(error) = result {
            tracing::warn!(
                error = (&*error as &dyn std::error::Error),
                "unable to clear token cache"
            );
        }
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for TokenCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("leeway", &self.leeway)
            .field("persistent", &self.backend.is_persistent())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aliri_clock::TestClock;

    fn fingerprint(scope: &str) -> Fingerprint {
        Fingerprint::new(
            ClientId::new("client_123"),
            None,
            scope.parse().unwrap(),
        )
    }

    fn entry(scope: &str, issued: u64, expires_in: u64) -> CacheEntry {
        CacheEntry {
            client_id: ClientId::new("client_123"),
            audience: jwt::Audience::new(DEFAULT_AUDIENCE),
            scope: scope.parse().unwrap(),
            access_token: Some(AccessToken::new("at-1")),
            id_token: None,
            refresh_token: None,
            lifetime: DurationSecs(expires_in),
            issued: UnixTime(issued),
            expiry: UnixTime(issued + expires_in),
            claims: None,
        }
    }

    fn cache() -> TokenCache<TestClock> {
        TokenCache::new(Arc::new(InMemoryCacheBackend::new()))
            .with_clock(TestClock::new(UnixTime(1_000)))
    }

    #[tokio::test]
    async fn entry_beyond_the_leeway_window_is_usable() {
        let cache = cache();
        let fp = fingerprint("openid");
        cache.save(&fp, entry("openid", 1_000, 70)).await;

        assert!(cache.get_usable(&fp).await.is_some());
    }

    #[tokio::test]
    async fn entry_within_the_leeway_window_is_a_miss() {
        let cache = cache();
        let fp = fingerprint("openid");
        cache.save(&fp, entry("openid", 1_000, 50)).await;

        assert!(cache.get_usable(&fp).await.is_none());
        // The raw entry is still there; the leeway policy only hides it.
        assert!(cache.get(&fp).await.is_some());
    }

    #[tokio::test]
    async fn entry_without_an_access_token_is_a_miss() {
        let cache = cache();
        let fp = fingerprint("openid");
        let mut refresh_only = entry("openid", 1_000, 86_400);
        refresh_only.access_token = None;
        refresh_only.refresh_token = Some(RefreshToken::new("rt-1"));
        cache.save(&fp, refresh_only).await;

        assert!(cache.get_usable(&fp).await.is_none());
    }

    #[tokio::test]
    async fn fingerprints_normalize_scope_order_and_duplicates() {
        let a = fingerprint("a b");
        let b = fingerprint("b a a");
        assert_eq!(a, b);
        assert_eq!(a.cache_key(), b.cache_key());

        let cache = cache();
        cache.save(&a, entry("a b", 1_000, 86_400)).await;
        assert!(cache.get_usable(&b).await.is_some());
    }

    #[tokio::test]
    async fn saves_union_scope_with_the_existing_entry() {
        let cache = cache();
        let fp = fingerprint("openid profile");
        cache.save(&fp, entry("openid profile", 1_000, 3_600)).await;
        cache.save(&fp, entry("openid email", 1_000, 3_600)).await;

        let stored = cache.get(&fp).await.unwrap();
        assert_eq!(stored.scope, "openid profile email".parse().unwrap());
    }

    #[tokio::test]
    async fn an_unrotated_refresh_token_survives_a_save() {
        let cache = cache();
        let fp = fingerprint("openid");

        let mut first = entry("openid", 1_000, 3_600);
        first.refresh_token = Some(RefreshToken::new("rt-1"));
        cache.save(&fp, first).await;

        cache.save(&fp, entry("openid", 2_000, 3_600)).await;
        let stored = cache.get(&fp).await.unwrap();
        assert_eq!(
            stored.refresh_token.as_deref().map(|rt| rt.as_str()),
            Some("rt-1")
        );
    }

    #[tokio::test]
    async fn a_rotated_refresh_token_replaces_the_stored_one() {
        let cache = cache();
        let fp = fingerprint("openid");

        let mut first = entry("openid", 1_000, 3_600);
        first.refresh_token = Some(RefreshToken::new("rt-1"));
        cache.save(&fp, first).await;

        let mut second = entry("openid", 2_000, 3_600);
        second.refresh_token = Some(RefreshToken::new("rt-2"));
        cache.save(&fp, second).await;

        let stored = cache.get(&fp).await.unwrap();
        assert_eq!(
            stored.refresh_token.as_deref().map(|rt| rt.as_str()),
            Some("rt-2")
        );
    }

    #[tokio::test]
    async fn clear_removes_one_or_all_entries() {
        let cache = cache();
        let a = fingerprint("a");
        let b = fingerprint("b");
        cache.save(&a, entry("a", 1_000, 86_400)).await;
        cache.save(&b, entry("b", 1_000, 86_400)).await;

        cache.clear(Some(&a)).await;
        assert!(cache.get(&a).await.is_none());
        assert!(cache.get(&b).await.is_some());

        cache.clear(None).await;
        assert!(cache.get(&b).await.is_none());
    }

    #[tokio::test]
    async fn file_backend_round_trips_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileCacheBackend::new(dir.path().join("tokens.json"));
        assert!(backend.is_persistent());

        let cache = TokenCache::new(Arc::new(backend)).with_clock(TestClock::new(UnixTime(1_000)));
        let fp = fingerprint("openid");
        cache.save(&fp, entry("openid", 1_000, 86_400)).await;

        let reread = TokenCache::new(Arc::new(FileCacheBackend::new(
            dir.path().join("tokens.json"),
        )))
        .with_clock(TestClock::new(UnixTime(1_000)));
        assert!(reread.get_usable(&fp).await.is_some());
    }
}
