//! Isolated execution of token exchanges
//!
//! When active, every token-endpoint exchange is routed through a dedicated
//! task that owns the HTTP client and the refresh-token stash. The secret
//! never appears in the caller's state: rotated refresh tokens are stashed
//! inside the task and redacted from replies, and refresh grants are sent
//! in with the secret slot empty for the task to fill. Compromise of the
//! caller's memory therefore does not expose the long-lived secret.
//!
//! Each call owns a dedicated reply channel, so responses cannot be matched
//! to the wrong pending call. The caller and the task each enforce the same
//! deadline independently; a caller that gives up waiting does not leave the
//! task hung, and vice versa.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::exchange::{request_token, ExchangeError, GrantParams, TokenRequestBody, TokenResponse};
use crate::RefreshToken;

pub(crate) struct TokenWorker {
    requests: mpsc::Sender<WorkerRequest>,
}

struct WorkerRequest {
    body: TokenRequestBody,
    timeout: Duration,
    reply: oneshot::Sender<Result<TokenResponse, ExchangeError>>,
}

impl TokenWorker {
    /// Spawns the worker task onto the current runtime
    pub(crate) fn spawn(http: reqwest::Client, token_url: reqwest::Url) -> Self {
        let (requests, inbox) = mpsc::channel(8);
        tokio::spawn(worker_loop(http, token_url, inbox));
        Self { requests }
    }

    /// Performs one exchange inside the isolated task
    pub(crate) async fn execute(
        &self,
        body: TokenRequestBody,
        timeout: Duration,
    ) -> Result<TokenResponse, ExchangeError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(WorkerRequest {
                body,
                timeout,
                reply,
            })
            .await
            .map_err(|_| ExchangeError::ChannelClosed)?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExchangeError::ChannelClosed),
            Err(_) => Err(ExchangeError::Timeout { operation: "fetch" }),
        }
    }
}

impl std::fmt::Debug for TokenWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TokenWorker").finish()
    }
}

async fn worker_loop(
    http: reqwest::Client,
    token_url: reqwest::Url,
    mut inbox: mpsc::Receiver<WorkerRequest>,
) {
    let mut stash: Option<RefreshToken> = None;

    while let Some(WorkerRequest {
        mut body,
        timeout,
        reply,
    }) = inbox.recv().await
    {
        if let GrantParams::RefreshToken { refresh_token } = &mut body.grant {
            if refresh_token.is_none() {
                match &stash {
                    Some(secret) => *refresh_token = Some(secret.clone()),
                    None => {
                        tracing::debug!("no refresh token in the worker stash");
                        let _ = reply.send(Err(ExchangeError::MissingRefreshToken));
                        continue;
                    }
                }
            }
        }

        let result = match tokio::time::timeout(
            timeout,
            request_token(&http, token_url.clone(), &body, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout { operation: "fetch" }),
        };

        let result = result.map(|mut response| {
            if let Some(rotated) = response.refresh_token.take() {
                tracing::debug!("stashing rotated refresh token in the worker");
                stash = Some(rotated);
            }
            response
        });

        if reply.send(result).is_err() {
            tracing::debug!("exchange caller went away before the reply arrived");
        }
    }

    tracing::debug!("token worker channel closed, stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthorizationCode, ClientId, CodeVerifier};
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn refresh_body() -> TokenRequestBody {
        TokenRequestBody {
            client_id: ClientId::new("client_123"),
            redirect_uri: "https://app.example.com/callback".parse().unwrap(),
            grant: GrantParams::RefreshToken {
                refresh_token: None,
            },
            extra: BTreeMap::new(),
        }
    }

    fn code_body() -> TokenRequestBody {
        TokenRequestBody {
            client_id: ClientId::new("client_123"),
            redirect_uri: "https://app.example.com/callback".parse().unwrap(),
            grant: GrantParams::AuthorizationCode {
                code: AuthorizationCode::new("the-code"),
                code_verifier: CodeVerifier::new("the-verifier"),
            },
            extra: BTreeMap::new(),
        }
    }

    fn token_json(refresh_token: Option<&str>) -> serde_json::Value {
        let mut body = json!({
            "access_token": "at-1",
            "id_token": "idt-1",
            "expires_in": 86400,
        });
        if let Some(rt) = refresh_token {
            body["refresh_token"] = json!(rt);
        }
        body
    }

    #[tokio::test]
    async fn refresh_with_an_empty_stash_reports_missing_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_json(None)))
            .expect(0)
            .mount(&server)
            .await;

        let worker = TokenWorker::spawn(
            reqwest::Client::new(),
            format!("{}/oauth/token", server.uri()).parse().unwrap(),
        );

        let err = worker
            .execute(refresh_body(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn rotated_refresh_tokens_are_stashed_and_redacted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_json(Some("rt-1"))))
            .mount(&server)
            .await;

        let worker = TokenWorker::spawn(
            reqwest::Client::new(),
            format!("{}/oauth/token", server.uri()).parse().unwrap(),
        );

        let response = worker
            .execute(code_body(), Duration::from_secs(5))
            .await
            .unwrap();

        // The secret stays inside the worker.
        assert!(response.refresh_token.is_none());
        assert_eq!(response.access_token.as_str(), "at-1");
    }

    #[tokio::test]
    async fn refresh_grants_use_the_stashed_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_partial_json(json!({"grant_type": "authorization_code"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_json(Some("rt-1"))))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_partial_json(
                json!({"grant_type": "refresh_token", "refresh_token": "rt-1"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_json(Some("rt-2"))))
            .expect(1)
            .mount(&server)
            .await;

        let worker = TokenWorker::spawn(
            reqwest::Client::new(),
            format!("{}/oauth/token", server.uri()).parse().unwrap(),
        );

        worker
            .execute(code_body(), Duration::from_secs(5))
            .await
            .unwrap();
        let response = worker
            .execute(refresh_body(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(response.refresh_token.is_none());
    }

    #[tokio::test]
    async fn a_slow_exchange_times_out_in_both_domains() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_json(None))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let worker = TokenWorker::spawn(
            reqwest::Client::new(),
            format!("{}/oauth/token", server.uri()).parse().unwrap(),
        );

        let err = worker
            .execute(code_body(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout { operation: "fetch" }));
    }
}
