//! Token endpoint exchange
//!
//! Both grant forms (authorization code and refresh token) POST a JSON body
//! to the token endpoint. The request carries its own transport deadline so
//! that cancellation aborts the in-flight request rather than abandoning it.

use std::collections::BTreeMap;
use std::time::Duration;

use aliri_clock::DurationSecs;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    AccessToken, AuthorizationCode, ClientId, CodeVerifier, IdToken, RefreshToken, Scope,
};

/// Grant-specific parameters of a token request
#[derive(Debug)]
pub(crate) enum GrantParams {
    /// Exchange an authorization code using its matching proof key
    AuthorizationCode {
        code: AuthorizationCode,
        code_verifier: CodeVerifier,
    },
    /// Exchange a refresh token
    ///
    /// The token is `None` when the exchange is routed through the isolated
    /// worker, which injects its own stashed secret.
    RefreshToken { refresh_token: Option<RefreshToken> },
}

/// The JSON body POSTed to the token endpoint
#[derive(Debug)]
pub(crate) struct TokenRequestBody {
    pub client_id: ClientId,
    pub redirect_uri: reqwest::Url,
    pub grant: GrantParams,
    pub extra: BTreeMap<String, String>,
}

impl TokenRequestBody {
    pub(crate) fn grant_type(&self) -> &'static str {
        match self.grant {
            GrantParams::AuthorizationCode { .. } => "authorization_code",
            GrantParams::RefreshToken { .. } => "refresh_token",
        }
    }

    pub(crate) fn is_refresh_grant(&self) -> bool {
        matches!(self.grant, GrantParams::RefreshToken { .. })
    }
}

impl Serialize for TokenRequestBody {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("grant_type", self.grant_type())?;
        map.serialize_entry("client_id", &self.client_id)?;
        map.serialize_entry("redirect_uri", self.redirect_uri.as_str())?;
        match &self.grant {
            GrantParams::AuthorizationCode {
                code,
                code_verifier,
            } => {
                map.serialize_entry("code", code)?;
                map.serialize_entry("code_verifier", code_verifier)?;
            }
            GrantParams::RefreshToken { refresh_token } => {
                if let Some(refresh_token) = refresh_token {
                    map.serialize_entry("refresh_token", refresh_token)?;
                }
            }
        }
        for (key, value) in &self.extra {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A token set as returned by the authority
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub id_token: Option<IdToken>,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub scope: Option<Scope>,
    pub expires_in: DurationSecs,
}

#[derive(Debug, Deserialize)]
struct OauthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// An error while attempting to exchange a grant with the authority
#[derive(Debug, Error)]
pub(crate) enum ExchangeError {
    /// The authority answered with an OAuth2 error object
    #[error("{error_description}")]
    Api {
        error: String,
        error_description: String,
    },
    /// No refresh token is available for the refresh grant
    #[error("the refresh token is missing or invalid")]
    MissingRefreshToken,
    /// Unable to send the request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBody(#[from] serde_json::Error),
    /// A deadline elapsed while waiting on the named operation
    #[error("Timeout when executing '{operation}'")]
    Timeout { operation: &'static str },
    /// The isolated exchange channel closed before answering
    #[error("the isolated exchange channel closed unexpectedly")]
    ChannelClosed,
}

impl ExchangeError {
    /// Whether this failure should switch the strategy to an iframe grant
    ///
    /// Only the absence (or server-side invalidation) of the refresh token
    /// triggers the fallback; every other failure surfaces directly.
    pub(crate) fn wants_iframe_fallback(&self) -> bool {
        match self {
            ExchangeError::MissingRefreshToken => true,
            ExchangeError::Api { error, .. } => {
                error == "missing_refresh_token" || error == "invalid_grant"
            }
            _ => false,
        }
    }
}

fn send_error(operation: &'static str) -> impl FnOnce(reqwest::Error) -> ExchangeError {
    move |e| {
        if e.is_timeout() {
            ExchangeError::Timeout { operation }
        } else {
            ExchangeError::RequestSend(e)
        }
    }
}

fn read_error(operation: &'static str) -> impl FnOnce(reqwest::Error) -> ExchangeError {
    move |e| {
        if e.is_timeout() {
            ExchangeError::Timeout { operation }
        } else {
            ExchangeError::BodyRead(e)
        }
    }
}

#[tracing::instrument(
    err,
    skip(http, token_url, body),
    fields(
        token_url = %token_url,
        grant_type = body.grant_type(),
        client_id = %body.client_id,
    ),
)]
pub(crate) async fn request_token(
    http: &reqwest::Client,
    token_url: reqwest::Url,
    body: &TokenRequestBody,
    timeout: Duration,
) -> Result<TokenResponse, ExchangeError> {
    tracing::trace!("requesting token from authority");

    let resp = http
        .post(token_url.clone())
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(send_error("fetch"))?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuing authority"
    );

    if !status.is_success() {
        let text = resp.text().await.map_err(read_error("fetch"))?;
        return Err(match serde_json::from_str::<OauthErrorBody>(&text) {
            Ok(body) => {
                let description = body
                    .error_description
                    .clone()
                    .unwrap_or_else(|| body.error.clone());
                ExchangeError::Api {
                    error: body.error,
                    error_description: description,
                }
            }
            Err(_) => ExchangeError::Api {
                error: "request_error".to_owned(),
                error_description: format!("HTTP error. Unable to fetch {}", token_url),
            },
        });
    }

    let bytes = resp.bytes().await.map_err(read_error("fetch"))?;
    let token: TokenResponse = serde_json::from_slice(&bytes)?;

    tracing::info!(
        has_id_token = token.id_token.is_some(),
        has_refresh_token = token.refresh_token.is_some(),
        lifetime = token.expires_in.0,
        "received new tokens"
    );

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_body(grant: GrantParams) -> TokenRequestBody {
        TokenRequestBody {
            client_id: ClientId::new("client_123"),
            redirect_uri: "https://app.example.com/callback".parse().unwrap(),
            grant,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn code_grant_serializes_expected_fields() {
        let body = base_body(GrantParams::AuthorizationCode {
            code: AuthorizationCode::new("the-code"),
            code_verifier: CodeVerifier::new("the-verifier"),
        });

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": "client_123",
                "redirect_uri": "https://app.example.com/callback",
                "code": "the-code",
                "code_verifier": "the-verifier",
            })
        );
    }

    #[test]
    fn refresh_grant_serializes_expected_fields() {
        let body = base_body(GrantParams::RefreshToken {
            refresh_token: Some(RefreshToken::new("the-refresh-token")),
        });

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "grant_type": "refresh_token",
                "client_id": "client_123",
                "redirect_uri": "https://app.example.com/callback",
                "refresh_token": "the-refresh-token",
            })
        );
    }

    #[test]
    fn worker_routed_refresh_grant_omits_the_secret() {
        let body = base_body(GrantParams::RefreshToken {
            refresh_token: None,
        });

        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("refresh_token").is_none());
    }

    #[test]
    fn custom_params_pass_through_to_the_body() {
        let mut body = base_body(GrantParams::RefreshToken {
            refresh_token: Some(RefreshToken::new("rt")),
        });
        body.extra
            .insert("custom_param".to_owned(), "hello world".to_owned());

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["custom_param"], "hello world");
    }

    #[test]
    fn invalid_grant_wants_the_iframe_fallback() {
        let err = ExchangeError::Api {
            error: "invalid_grant".to_owned(),
            error_description: "revoked".to_owned(),
        };
        assert!(err.wants_iframe_fallback());
        assert!(ExchangeError::MissingRefreshToken.wants_iframe_fallback());
    }

    #[test]
    fn other_api_errors_do_not_fall_back() {
        let err = ExchangeError::Api {
            error: "server_error".to_owned(),
            error_description: "boom".to_owned(),
        };
        assert!(!err.wants_iframe_fallback());
        assert!(!ExchangeError::Timeout { operation: "fetch" }.wants_iframe_fallback());
    }
}
