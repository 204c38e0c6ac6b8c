//! The hidden authorization round-trip
//!
//! A silent authorization attempt navigates an invisible, host-provided
//! context to the authorization endpoint with `prompt=none` and waits for
//! the code response to be messaged back. The attempt itself is ephemeral:
//! a fresh state, nonce, and proof-key pair per attempt, never cached.

use std::collections::BTreeMap;
use std::time::Duration;

use aliri::jwt;
use async_trait::async_trait;
use thiserror::Error;

use crate::pkce::{self, PkcePair};
use crate::{AuthorizationCode, ClientId, CodeVerifier, Nonce, Scope, State, StateRef};

/// One ephemeral silent authorization attempt
#[derive(Debug)]
pub struct AuthorizationAttempt {
    state: State,
    nonce: Nonce,
    pkce: PkcePair,
    redirect_uri: reqwest::Url,
    scope: Scope,
    audience: Option<jwt::Audience>,
    extra: BTreeMap<String, String>,
}

impl AuthorizationAttempt {
    /// Generates a new attempt with fresh state, nonce, and proof key
    pub fn new(
        redirect_uri: reqwest::Url,
        scope: Scope,
        audience: Option<jwt::Audience>,
        extra: BTreeMap<String, String>,
    ) -> Self {
        Self {
            state: pkce::random_state(),
            nonce: pkce::random_nonce(),
            pkce: PkcePair::generate(),
            redirect_uri,
            scope,
            audience,
            extra,
        }
    }

    /// The anti-replay state sent with this attempt
    #[inline]
    pub fn state(&self) -> &StateRef {
        &self.state
    }

    /// The nonce bound into the requested identity token
    #[inline]
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// The redirect URI sent with this attempt
    #[inline]
    pub fn redirect_uri(&self) -> &reqwest::Url {
        &self.redirect_uri
    }

    /// Consumes the attempt, yielding the proof key for the code exchange
    #[inline]
    pub fn into_verifier(self) -> CodeVerifier {
        self.pkce.into_verifier()
    }

    /// Builds the authorization URL for this attempt
    pub fn authorize_url(
        &self,
        authorize_endpoint: &reqwest::Url,
        client_id: &ClientId,
    ) -> reqwest::Url {
        let mut url = authorize_endpoint.clone();

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", client_id.as_str());
            query.append_pair("response_type", "code");
            query.append_pair("response_mode", "web_message");
            query.append_pair("prompt", "none");
            query.append_pair("state", self.state.as_str());
            query.append_pair("nonce", self.nonce.as_str());
            query.append_pair("redirect_uri", self.redirect_uri.as_str());
            query.append_pair("code_challenge", self.pkce.challenge());
            query.append_pair("code_challenge_method", "S256");
            query.append_pair("scope", &self.scope.to_string());
            if let Some(audience) = &self.audience {
                query.append_pair("audience", audience.as_str());
            }
            for (key, value) in &self.extra {
                query.append_pair(key, value);
            }
        }

        url
    }
}

/// A successful message from the authorization context
#[derive(Clone, Debug)]
pub struct AuthorizeMessage {
    /// The state echoed by the authorization server
    pub state: State,
    /// The authorization code to exchange
    pub code: AuthorizationCode,
}

/// A failed authorization round-trip
#[derive(Debug, Error)]
pub enum AuthorizeError {
    /// The authorization server answered with an error message
    ///
    /// With `prompt=none` this commonly reports that interactive login is
    /// required.
    #[error("{error_description}")]
    Denied {
        /// The OAuth2 error code
        error: String,
        /// The human-readable description
        error_description: String,
    },
    /// No response was messaged back within the deadline
    #[error("timed out waiting for the authorization response")]
    Timeout,
}

/// A host-provided invisible authorization context
///
/// Implementations navigate an invisible same-origin context (an embedded
/// webview, a test stub) to the given URL and resolve with the messaged
/// response. The implementation should honor `timeout` by cancelling its
/// navigation; the orchestrator independently enforces the same deadline,
/// so a misbehaving implementation cannot hang a caller.
#[async_trait]
pub trait AsyncAuthorizeChannel: Send + Sync {
    /// Performs one hidden authorization round-trip
    async fn authorize(
        &self,
        url: reqwest::Url,
        timeout: Duration,
    ) -> Result<AuthorizeMessage, AuthorizeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn attempt(extra: BTreeMap<String, String>) -> AuthorizationAttempt {
        AuthorizationAttempt::new(
            "https://app.example.com/callback".parse().unwrap(),
            "openid profile".parse().unwrap(),
            Some(jwt::Audience::new("https://api.example.com/")),
            extra,
        )
    }

    fn params(url: &reqwest::Url) -> HashMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn authorize_url_carries_the_silent_flow_parameters() {
        let attempt = attempt(BTreeMap::new());
        let url = attempt.authorize_url(
            &"https://issuer.example.com/authorize".parse().unwrap(),
            &ClientId::new("client_123"),
        );

        let params = params(&url);
        assert_eq!(params["client_id"], "client_123");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["response_mode"], "web_message");
        assert_eq!(params["prompt"], "none");
        assert_eq!(params["redirect_uri"], "https://app.example.com/callback");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["scope"], "openid profile");
        assert_eq!(params["audience"], "https://api.example.com/");
        assert_eq!(params["state"], attempt.state().as_str());
        assert_eq!(params["nonce"], attempt.nonce().as_str());
        assert!(!params["code_challenge"].is_empty());
    }

    #[test]
    fn custom_parameters_pass_through_to_the_authorize_url() {
        let mut extra = BTreeMap::new();
        extra.insert("custom_param".to_owned(), "hello world".to_owned());
        let attempt = attempt(extra);

        let url = attempt.authorize_url(
            &"https://issuer.example.com/authorize".parse().unwrap(),
            &ClientId::new("client_123"),
        );

        assert_eq!(params(&url)["custom_param"], "hello world");
    }

    #[test]
    fn audience_is_omitted_when_not_requested() {
        let attempt = AuthorizationAttempt::new(
            "https://app.example.com/callback".parse().unwrap(),
            "openid".parse().unwrap(),
            None,
            BTreeMap::new(),
        );

        let url = attempt.authorize_url(
            &"https://issuer.example.com/authorize".parse().unwrap(),
            &ClientId::new("client_123"),
        );

        assert!(!params(&url).contains_key("audience"));
    }

    #[test]
    fn each_attempt_uses_fresh_state_nonce_and_proof_key() {
        let a = attempt(BTreeMap::new());
        let b = attempt(BTreeMap::new());
        assert_ne!(a.state(), b.state());
        assert_ne!(a.nonce(), b.nonce());
    }
}
