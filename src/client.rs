//! The silent token client
//!
//! [`SilentClient::get_token_silently`] answers "give me a valid access
//! token now" without visible user interaction: a cache fast path, a
//! cross-context lock around the renewal critical section, a refresh-token
//! exchange (isolated in a worker when possible) with a hidden
//! authorization attempt as the fallback, response validation, and a
//! merge-write back into the cache.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aliri::jwt;
use aliri_clock::{Clock, System};

use crate::authorize::{
    AsyncAuthorizeChannel, AuthorizationAttempt, AuthorizeError, AuthorizeMessage,
};
use crate::cache::{
    AsyncCacheBackend, CacheEntry, Fingerprint, InMemoryCacheBackend, TokenCache,
};
use crate::error::SilentTokenError;
use crate::exchange::{self, ExchangeError, GrantParams, TokenRequestBody, TokenResponse};
use crate::lock::{AsyncRefreshLock, FileRefreshLock};
use crate::markers::{
    AsyncSessionMarkerStore, NoopSessionMarkerStore, LEGACY_SESSION_MARKER_KEY,
    SESSION_MARKER_KEY,
};
use crate::validate::{self, AsyncIdTokenVerifier, IdTokenClaims, TokenExpectations};
use crate::worker::TokenWorker;
use crate::{ClientId, Nonce, Scope, TokenSet};

/// The scope requested when a caller does not broaden it
pub const DEFAULT_SCOPE: &str = "openid profile email";

/// The default deadline for any single token-endpoint exchange
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// The default deadline for the hidden authorization round-trip
pub const DEFAULT_AUTHORIZE_TIMEOUT: Duration = Duration::from_secs(60);

/// The default deadline for acquiring the cross-context refresh lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_SESSION_CHECK_EXPIRY_DAYS: u32 = 1;

/// Static configuration of a silent token client
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// The authorization endpoint
    pub authorize_url: reqwest::Url,
    /// The token endpoint
    pub token_url: reqwest::Url,
    /// The client ID tokens are requested for
    pub client_id: ClientId,
    /// The redirect URI registered for this client
    pub redirect_uri: reqwest::Url,
    /// The issuer expected on identity tokens
    pub issuer: jwt::Issuer,
    /// The audience applied when a caller does not name one
    pub default_audience: Option<jwt::Audience>,
    /// The scope unioned into every request
    pub default_scope: Scope,
    /// Whether refresh-token issuance is enabled for this client
    pub use_refresh_tokens: bool,
    /// The deadline for hidden authorization round-trips, unless a call
    /// overrides it
    pub authorize_timeout: Duration,
    /// How many days the session markers remain readable
    pub session_check_expiry_days: u32,
    /// Authorization parameters sent with every request
    pub default_params: BTreeMap<String, String>,
}

impl ClientOptions {
    /// Constructs options for a client of the given authority
    pub fn new(
        authorize_url: reqwest::Url,
        token_url: reqwest::Url,
        client_id: ClientId,
        redirect_uri: reqwest::Url,
        issuer: jwt::Issuer,
    ) -> Self {
        Self {
            authorize_url,
            token_url,
            client_id,
            redirect_uri,
            issuer,
            default_audience: None,
            default_scope: Scope::from_static(DEFAULT_SCOPE),
            use_refresh_tokens: false,
            authorize_timeout: DEFAULT_AUTHORIZE_TIMEOUT,
            session_check_expiry_days: DEFAULT_SESSION_CHECK_EXPIRY_DAYS,
            default_params: BTreeMap::new(),
        }
    }

    /// Sets the audience applied when a caller does not name one
    pub fn with_default_audience(mut self, audience: jwt::Audience) -> Self {
        self.default_audience = Some(audience);
        self
    }

    /// Replaces the scope unioned into every request
    pub fn with_default_scope(mut self, scope: Scope) -> Self {
        self.default_scope = scope;
        self
    }

    /// Enables or disables refresh-token issuance
    pub fn with_refresh_tokens(mut self, use_refresh_tokens: bool) -> Self {
        self.use_refresh_tokens = use_refresh_tokens;
        self
    }

    /// Sets the default deadline for hidden authorization round-trips
    pub fn with_authorize_timeout(mut self, authorize_timeout: Duration) -> Self {
        self.authorize_timeout = authorize_timeout;
        self
    }

    /// Sets how many days the session markers remain readable
    pub fn with_session_check_expiry_days(mut self, days: u32) -> Self {
        self.session_check_expiry_days = days;
        self
    }

    /// Adds an authorization parameter sent with every request
    pub fn with_default_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_params.insert(key.into(), value.into());
        self
    }
}

/// Per-call options for [`SilentClient::get_token_silently`]
#[derive(Clone, Debug, Default)]
pub struct GetTokenOptions {
    /// The audience to request; falls back to the client's default audience
    pub audience: Option<jwt::Audience>,
    /// Additional scope, unioned with the client's default scope
    pub scope: Option<Scope>,
    /// Skip the cache fast path and force a renewal
    pub ignore_cache: bool,
    /// Deadline for each token-endpoint exchange in this call
    pub timeout: Option<Duration>,
    /// Deadline for the hidden authorization round-trip in this call
    pub authorize_timeout: Option<Duration>,
    /// Overrides the client's redirect URI for this call
    pub redirect_uri: Option<reqwest::Url>,
    /// Authorization parameters for this call, overriding the client's
    /// defaults key-by-key
    pub extra_params: BTreeMap<String, String>,
}

/// Builds a [`SilentClient`], probing the environment once
pub struct SilentClientBuilder {
    options: ClientOptions,
    channel: Arc<dyn AsyncAuthorizeChannel>,
    verifier: Arc<dyn AsyncIdTokenVerifier>,
    cache_backend: Arc<dyn AsyncCacheBackend>,
    lock: Arc<dyn AsyncRefreshLock>,
    markers: Arc<dyn AsyncSessionMarkerStore>,
    http: Option<reqwest::Client>,
    lock_timeout: Duration,
    allow_isolated_exchange: bool,
}

impl SilentClientBuilder {
    /// Replaces the in-memory cache backend
    pub fn with_cache_backend(mut self, backend: Arc<dyn AsyncCacheBackend>) -> Self {
        self.cache_backend = backend;
        self
    }

    /// Replaces the cross-context refresh lock
    pub fn with_lock(mut self, lock: Arc<dyn AsyncRefreshLock>) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the deadline for acquiring the refresh lock
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Replaces the session marker store
    pub fn with_marker_store(mut self, markers: Arc<dyn AsyncSessionMarkerStore>) -> Self {
        self.markers = markers;
        self
    }

    /// Supplies a shared HTTP client
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Allows or forbids isolating the refresh exchange in a worker task
    ///
    /// Isolation is a hardening measure, never a requirement; forbidding it
    /// runs every exchange on the caller's task instead.
    pub fn with_isolated_exchange(mut self, allow: bool) -> Self {
        self.allow_isolated_exchange = allow;
        self
    }

    /// Builds the client
    ///
    /// The isolation probe runs once, here: refresh grants are routed
    /// through a worker task only when refresh tokens are enabled, the
    /// cache backend does not already persist the secret in plaintext,
    /// isolation has not been forbidden, and a runtime is available to
    /// spawn the worker onto. The chosen route is fixed for the client's
    /// lifetime.
    pub fn build(self) -> SilentClient {
        let http = self.http.unwrap_or_default();
        let cache = TokenCache::new(self.cache_backend);

        let isolate = self.options.use_refresh_tokens
            && !cache.is_persistent()
            && self.allow_isolated_exchange
            && tokio::runtime::Handle::try_current().is_ok();

        let worker = if isolate {
            Some(TokenWorker::spawn(
                http.clone(),
                self.options.token_url.clone(),
            ))
        } else {
            None
        };

        tracing::debug!(
            isolated_exchange = worker.is_some(),
            use_refresh_tokens = self.options.use_refresh_tokens,
            persistent_cache = cache.is_persistent(),
            "selected token exchange route"
        );

        SilentClient {
            options: self.options,
            http,
            cache,
            lock: self.lock,
            channel: self.channel,
            verifier: self.verifier,
            markers: self.markers,
            worker,
            lock_timeout: self.lock_timeout,
        }
    }
}

impl fmt::Debug for SilentClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SilentClientBuilder")
            .field("options", &self.options)
            .field("lock_timeout", &self.lock_timeout)
            .field("allow_isolated_exchange", &self.allow_isolated_exchange)
            .finish()
    }
}

/// A client that silently obtains access tokens for one OAuth2 client
pub struct SilentClient {
    options: ClientOptions,
    http: reqwest::Client,
    cache: TokenCache,
    lock: Arc<dyn AsyncRefreshLock>,
    channel: Arc<dyn AsyncAuthorizeChannel>,
    verifier: Arc<dyn AsyncIdTokenVerifier>,
    markers: Arc<dyn AsyncSessionMarkerStore>,
    worker: Option<TokenWorker>,
    lock_timeout: Duration,
}

impl SilentClient {
    /// Begins building a client
    ///
    /// The authorization channel and identity-token verifier are external
    /// collaborators the host must provide; everything else has a default.
    pub fn builder(
        options: ClientOptions,
        channel: Arc<dyn AsyncAuthorizeChannel>,
        verifier: Arc<dyn AsyncIdTokenVerifier>,
    ) -> SilentClientBuilder {
        SilentClientBuilder {
            options,
            channel,
            verifier,
            cache_backend: Arc::new(InMemoryCacheBackend::new()),
            lock: Arc::new(FileRefreshLock::new(std::env::temp_dir())),
            markers: Arc::new(NoopSessionMarkerStore),
            http: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            allow_isolated_exchange: true,
        }
    }

    /// Whether exchanges are routed through the isolated worker
    pub fn is_exchange_isolated(&self) -> bool {
        self.worker.is_some()
    }

    /// Removes every cached token set
    pub async fn clear_cache(&self) {
        self.cache.clear(None).await;
    }

    /// Obtains a valid access token without visible user interaction
    ///
    /// A usable cached token is returned immediately, with no lock or
    /// network cost. Otherwise the renewal runs under the cross-context
    /// lock: a refresh-token exchange when one is available, falling back
    /// to a hidden authorization attempt only when the refresh token is
    /// missing or invalid. Every other failure surfaces unchanged, the
    /// lock is released on every path, and a failed attempt never touches
    /// the cache.
    pub async fn get_token_silently(
        &self,
        options: GetTokenOptions,
    ) -> Result<TokenSet, SilentTokenError> {
        let scope = match &options.scope {
            Some(requested) => self.options.default_scope.union(requested),
            None => self.options.default_scope.clone(),
        };
        let audience = options
            .audience
            .clone()
            .or_else(|| self.options.default_audience.clone());
        let fingerprint =
            Fingerprint::new(self.options.client_id.clone(), audience.clone(), scope.clone());

        if !options.ignore_cache {
            if let Some(tokens) = self.cached_tokens(&fingerprint).await {
                tracing::debug!("returning cached token without lock or network");
                return Ok(tokens);
            }
        }

        let _guard = self
            .lock
            .acquire(self.lock_timeout)
            .await
            .map_err(|_| SilentTokenError::LockTimeout)?;

        // Another context may have renewed while we waited for the lock.
        if !options.ignore_cache {
            if let Some(tokens) = self.cached_tokens(&fingerprint).await {
                tracing::debug!("another context renewed the token while we waited");
                return Ok(tokens);
            }
        }

        self.renew(&fingerprint, audience, scope, &options).await
        // _guard drops here and on every early return above, releasing the
        // lock exactly once per invocation
    }

    async fn cached_tokens(&self, fingerprint: &Fingerprint) -> Option<TokenSet> {
        self.cache
            .get_usable(fingerprint)
            .await
            .and_then(CacheEntry::into_token_set)
    }

    async fn renew(
        &self,
        fingerprint: &Fingerprint,
        audience: Option<jwt::Audience>,
        scope: Scope,
        options: &GetTokenOptions,
    ) -> Result<TokenSet, SilentTokenError> {
        let fetch_timeout = options.timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT);

        let (response, nonce) = if self.options.use_refresh_tokens {
            match self.refresh_grant(fingerprint, options, fetch_timeout).await {
                Ok(response) => (response, None),
                Err(error) if error.wants_iframe_fallback() => {
                    tracing::debug!(
                        "refresh token missing or invalid, falling back to a hidden authorization attempt"
                    );
                    self.iframe_grant(&scope, audience.as_ref(), options, fetch_timeout)
                        .await?
                }
                Err(error) => return Err(error.into()),
            }
        } else {
            self.iframe_grant(&scope, audience.as_ref(), options, fetch_timeout)
                .await?
        };

        let claims = self.validate_response(&response, nonce).await?;

        let now = System.now();
        let granted_scope = response.scope.clone().unwrap_or(scope);

        let entry = CacheEntry {
            client_id: self.options.client_id.clone(),
            audience: fingerprint.audience().clone(),
            scope: granted_scope.clone(),
            access_token: Some(response.access_token.clone()),
            id_token: response.id_token.clone(),
            refresh_token: response.refresh_token.clone(),
            lifetime: response.expires_in,
            issued: now,
            expiry: now + response.expires_in,
            claims: claims.clone(),
        };
        self.cache.save(fingerprint, entry).await;

        self.write_session_markers().await;

        Ok(TokenSet::new(
            response.access_token,
            response.id_token,
            granted_scope,
            fingerprint.audience().clone(),
            response.expires_in,
            now,
            claims,
        ))
    }

    async fn refresh_grant(
        &self,
        fingerprint: &Fingerprint,
        options: &GetTokenOptions,
        timeout: Duration,
    ) -> Result<TokenResponse, ExchangeError> {
        let refresh_token = match &self.worker {
            // The worker injects its own stashed secret.
            Some(_) => None,
            None => match self
                .cache
                .get(fingerprint)
                .await
                .and_then(|entry| entry.refresh_token)
            {
                Some(refresh_token) => Some(refresh_token),
                None => return Err(ExchangeError::MissingRefreshToken),
            },
        };

        let body = TokenRequestBody {
            client_id: self.options.client_id.clone(),
            redirect_uri: self.effective_redirect_uri(options),
            grant: GrantParams::RefreshToken { refresh_token },
            extra: self.merged_params(options),
        };

        self.execute(body, timeout).await
    }

    async fn iframe_grant(
        &self,
        scope: &Scope,
        audience: Option<&jwt::Audience>,
        options: &GetTokenOptions,
        fetch_timeout: Duration,
    ) -> Result<(TokenResponse, Option<Nonce>), SilentTokenError> {
        let attempt = AuthorizationAttempt::new(
            self.effective_redirect_uri(options),
            scope.clone(),
            audience.cloned(),
            self.merged_params(options),
        );
        let url = attempt.authorize_url(&self.options.authorize_url, &self.options.client_id);

        let authorize_timeout = options
            .authorize_timeout
            .or(options.timeout)
            .unwrap_or(self.options.authorize_timeout);

        let message = self.run_authorize(url, authorize_timeout).await?;
        validate::validate_state(attempt.state(), &message.state)?;

        let nonce = attempt.nonce().clone();
        let redirect_uri = attempt.redirect_uri().clone();
        let body = TokenRequestBody {
            client_id: self.options.client_id.clone(),
            redirect_uri,
            grant: GrantParams::AuthorizationCode {
                code: message.code,
                code_verifier: attempt.into_verifier(),
            },
            extra: self.merged_params(options),
        };

        let response = self.execute(body, fetch_timeout).await?;
        Ok((response, Some(nonce)))
    }

    /// Runs the hidden authorization round-trip with the deadline enforced
    /// on both sides of the channel
    async fn run_authorize(
        &self,
        url: reqwest::Url,
        timeout: Duration,
    ) -> Result<AuthorizeMessage, SilentTokenError> {
        match tokio::time::timeout(timeout, self.channel.authorize(url, timeout)).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(AuthorizeError::Denied {
                error,
                error_description,
            })) => {
                tracing::debug!(error = %error, "authorization context reported an error");
                Err(SilentTokenError::Api {
                    error,
                    error_description,
                })
            }
            Ok(Err(AuthorizeError::Timeout)) | Err(_) => Err(SilentTokenError::Timeout {
                operation: "authorize",
            }),
        }
    }

    async fn validate_response(
        &self,
        response: &TokenResponse,
        nonce: Option<Nonce>,
    ) -> Result<Option<IdTokenClaims>, SilentTokenError> {
        let id_token = match &response.id_token {
            Some(id_token) => id_token,
            None => return Ok(None),
        };

        let expectations = TokenExpectations {
            issuer: self.options.issuer.clone(),
            audience: jwt::Audience::new(self.options.client_id.as_str().to_owned()),
            nonce,
        };

        let claims = validate::validate_id_token(&*self.verifier, id_token, &expectations)
            .await
            .map_err(SilentTokenError::from)?;
        Ok(Some(claims))
    }

    async fn execute(
        &self,
        body: TokenRequestBody,
        timeout: Duration,
    ) -> Result<TokenResponse, ExchangeError> {
        match &self.worker {
            Some(worker) => worker.execute(body, timeout).await,
            None => {
                exchange::request_token(&self.http, self.options.token_url.clone(), &body, timeout)
                    .await
            }
        }
    }

    async fn write_session_markers(&self) {
        let days = self.options.session_check_expiry_days;
        for key in &[LEGACY_SESSION_MARKER_KEY, SESSION_MARKER_KEY] {
            if let Err(error) = self.markers.set(key, days).await {
                tracing::warn!(
                    error = (&*error as &dyn std::error::Error),
                    marker = %key,
                    "unable to write session marker"
                );
            }
        }
    }

    fn effective_redirect_uri(&self, options: &GetTokenOptions) -> reqwest::Url {
        options
            .redirect_uri
            .clone()
            .unwrap_or_else(|| self.options.redirect_uri.clone())
    }

    fn merged_params(&self, options: &GetTokenOptions) -> BTreeMap<String, String> {
        let mut params = self.options.default_params.clone();
        params.extend(
            options
                .extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        params
    }
}

impl fmt::Debug for SilentClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SilentClient")
            .field("options", &self.options)
            .field("cache", &self.cache)
            .field("isolated_exchange", &self.worker.is_some())
            .finish()
    }
}
