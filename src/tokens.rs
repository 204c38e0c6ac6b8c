use aliri_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::validate::IdTokenClaims;
use crate::{AccessToken, AccessTokenRef, IdToken, IdTokenRef, Scope};
use aliri::jwt;

/// A freshly obtained token set with lifetime bookkeeping
///
/// This is the value produced by a successful silent token request. The
/// refresh token, when one exists, is deliberately absent: it either lives
/// in the isolated exchange worker or in the token cache, never in values
/// handed back to callers.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenSet {
    access_token: AccessToken,
    id_token: Option<IdToken>,
    scope: Scope,
    audience: jwt::Audience,
    lifetime: DurationSecs,
    issued: UnixTime,
    expiry: UnixTime,
    claims: Option<IdTokenClaims>,
}

impl TokenSet {
    pub(crate) fn new(
        access_token: AccessToken,
        id_token: Option<IdToken>,
        scope: Scope,
        audience: jwt::Audience,
        lifetime: DurationSecs,
        issued: UnixTime,
        claims: Option<IdTokenClaims>,
    ) -> Self {
        Self {
            access_token,
            id_token,
            scope,
            audience,
            lifetime,
            issued,
            expiry: issued + lifetime,
            claims,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the ID token, if one was issued
    #[inline]
    pub fn id_token(&self) -> Option<&IdTokenRef> {
        self.id_token.as_deref()
    }

    /// Gets the scope granted with this token set
    #[inline]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Gets the audience this token set was issued for
    #[inline]
    pub fn audience(&self) -> &jwt::AudienceRef {
        &self.audience
    }

    /// Gets the token's lifetime as reported by the authority
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Gets the time that the token was issued
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the decoded claims of the ID token, if one was issued and decoded
    #[inline]
    pub fn claims(&self) -> Option<&IdTokenClaims> {
        self.claims.as_ref()
    }

    /// Gets a duration for how much longer the token will be valid as of
    /// the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        if time < self.expiry {
            self.expiry - time
        } else {
            DurationSecs(0)
        }
    }
}
