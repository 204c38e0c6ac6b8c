//! Error taxonomy for the silent token flow

use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::validate::IdTokenValidationError;

/// An error produced while silently obtaining a token
///
/// Every failure of [`get_token_silently`][crate::SilentClient::get_token_silently]
/// surfaces as one of these variants. The cross-context lock is released on
/// every failure path, and the token cache is never modified by a failed
/// attempt.
#[derive(Debug, Error)]
pub enum SilentTokenError {
    /// The cross-context lock was not acquired within its deadline
    ///
    /// Another context is performing a silent refresh. This is not an
    /// authentication failure; retrying later is reasonable.
    #[error("timed out waiting for the silent authentication lock")]
    LockTimeout,

    /// The authorization response carried a state that does not match the
    /// state sent with the request
    ///
    /// Signals a stale or tampered response. Never retried.
    #[error("Invalid state")]
    InvalidState,

    /// The authority answered with an OAuth2 error object
    #[error("{error_description}")]
    Api {
        /// The OAuth2 error code reported by the authority
        error: String,
        /// The human-readable description reported by the authority
        error_description: String,
    },

    /// A transport-level failure while talking to the authority
    #[error("error sending request to authority")]
    Network(#[source] reqwest::Error),

    /// A deadline elapsed while waiting on the named operation
    #[error("Timeout when executing '{operation}'")]
    Timeout {
        /// The operation that exceeded its deadline
        operation: &'static str,
    },

    /// The token body returned by the authority could not be understood
    #[error("error deserializing token body from authority")]
    TokenBody(#[source] serde_json::Error),

    /// The identity token failed signature, claims, or nonce validation
    #[error("identity token validation failed")]
    TokenValidation(#[from] IdTokenValidationError),

    /// The isolated exchange channel closed before answering
    #[error("the isolated exchange channel closed unexpectedly")]
    ChannelClosed,
}

impl From<ExchangeError> for SilentTokenError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Api {
                error,
                error_description,
            } => SilentTokenError::Api {
                error,
                error_description,
            },
            // Fallback to the iframe grant is decided before conversion;
            // a leak here still reports the condition faithfully.
            ExchangeError::MissingRefreshToken => SilentTokenError::Api {
                error: "missing_refresh_token".to_owned(),
                error_description: "The refresh token is missing or invalid".to_owned(),
            },
            ExchangeError::RequestSend(e) => {
                if e.is_timeout() {
                    SilentTokenError::Timeout { operation: "fetch" }
                } else {
                    SilentTokenError::Network(e)
                }
            }
            ExchangeError::BodyRead(e) => SilentTokenError::Network(e),
            ExchangeError::TokenBody(e) => SilentTokenError::TokenBody(e),
            ExchangeError::Timeout { operation } => SilentTokenError::Timeout { operation },
            ExchangeError::ChannelClosed => SilentTokenError::ChannelClosed,
        }
    }
}
