//! Validation of authorization and token responses
//!
//! State equality is checked here; signature and standard-claims checking of
//! identity tokens is delegated to an external [`AsyncIdTokenVerifier`], and
//! the nonce issued for the attempt is enforced on top of whatever the
//! verifier checked. Any failure is fatal to the attempt.

use aliri::jwt;
use aliri_clock::UnixTime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SilentTokenError;
use crate::{IdTokenRef, Nonce, StateRef};

/// The decoded claims of a verified identity token
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// The `iss` claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<jwt::Issuer>,

    /// The `sub` claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<jwt::Subject>,

    /// The `exp` claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<UnixTime>,

    /// The `iat` claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<UnixTime>,

    /// The `nonce` claim, bound at authorization time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Nonce>,

    /// Any remaining claims
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What a verified identity token is expected to assert
#[derive(Clone, Debug)]
pub struct TokenExpectations {
    /// The issuer the token must have been minted by
    pub issuer: jwt::Issuer,
    /// The audience the token must be addressed to (the client ID)
    pub audience: jwt::Audience,
    /// The nonce issued for this attempt, when the token was requested
    /// through an authorization round-trip
    pub nonce: Option<Nonce>,
}

/// An external verifier for identity token signatures and standard claims
///
/// Implementations are expected to check the signature against the issuer's
/// keys and the standard claims (`iss`, `aud`, `exp`, `iat`) against the
/// provided expectations, returning the decoded claims on success. The
/// nonce is re-checked by this crate after the verifier returns.
#[async_trait]
pub trait AsyncIdTokenVerifier: Send + Sync {
    /// Verifies the token and returns its decoded claims
    async fn verify(
        &self,
        id_token: &IdTokenRef,
        expectations: &TokenExpectations,
    ) -> Result<IdTokenClaims, Box<dyn std::error::Error + Send + Sync + 'static>>;
}

/// An error validating a received identity token
#[derive(Debug, Error)]
pub enum IdTokenValidationError {
    /// The external verifier rejected the token
    #[error("identity token rejected by the verifier")]
    Verifier(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The token's nonce does not match the nonce issued for this attempt
    #[error("nonce in the identity token does not match the nonce issued for this attempt")]
    NonceMismatch,
    /// A nonce was issued for this attempt but the token carries none
    #[error("identity token is missing the expected nonce")]
    MissingNonce,
}

/// Checks that the authorization response's state matches the state sent
///
/// A mismatch means the response belongs to a different (possibly stale or
/// attacker-supplied) attempt and must never be accepted.
pub fn validate_state(expected: &StateRef, received: &StateRef) -> Result<(), SilentTokenError> {
    if expected == received {
        Ok(())
    } else {
        tracing::warn!("authorization response state does not match the request");
        Err(SilentTokenError::InvalidState)
    }
}

/// Verifies an identity token through the external verifier and enforces
/// the attempt's nonce
pub async fn validate_id_token(
    verifier: &dyn AsyncIdTokenVerifier,
    id_token: &IdTokenRef,
    expectations: &TokenExpectations,
) -> Result<IdTokenClaims, IdTokenValidationError> {
    let claims = verifier
        .verify(id_token, expectations)
        .await
        .map_err(IdTokenValidationError::Verifier)?;

    if let Some(expected) = &expectations.nonce {
        match &claims.nonce {
            Some(actual) if actual == expected => {}
            Some(_) => return Err(IdTokenValidationError::NonceMismatch),
            None => return Err(IdTokenValidationError::MissingNonce),
        }
    }

    Ok(claims)
}
