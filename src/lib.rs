//! Silent renewal of OAuth2 access tokens for embedded user agents
//!
//! This library is the non-interactive core of an OAuth2/OIDC client: given
//! a previously authenticated session, it obtains a fresh access token
//! without visible user interaction while protecting the long-lived refresh
//! secret and preventing redundant concurrent renewals across independent
//! same-origin contexts.
//!
//! A renewal is answered from the token cache whenever a usable entry
//! exists; that fast path takes no lock and performs no network I/O. On a
//! miss, all contexts serialize on a single shared lock, and the holder
//! either exchanges a refresh token or runs a hidden authorization attempt
//! with `prompt=none` and PKCE, validates the response (state, identity
//! token, nonce), and merge-writes the result back into the cache for
//! everyone else.
//!
//! When refresh tokens are in play and the cache does not already persist
//! them in plaintext, the exchange runs inside a dedicated worker task that
//! owns the secret; rotated refresh tokens never enter the caller's state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use aliri::jwt;
//! use aliri_silent::{ClientId, ClientOptions, GetTokenOptions, SilentClient};
//!
//! # use std::time::Duration;
//! # struct MyAuthorizeChannel;
//! # #[async_trait::async_trait]
//! # impl aliri_silent::authorize::AsyncAuthorizeChannel for MyAuthorizeChannel {
//! #     async fn authorize(
//! #         &self,
//! #         _url: reqwest::Url,
//! #         _timeout: Duration,
//! #     ) -> Result<aliri_silent::authorize::AuthorizeMessage, aliri_silent::authorize::AuthorizeError> {
//! #         unimplemented!()
//! #     }
//! # }
//! # struct MyVerifier;
//! # #[async_trait::async_trait]
//! # impl aliri_silent::validate::AsyncIdTokenVerifier for MyVerifier {
//! #     async fn verify(
//! #         &self,
//! #         _id_token: &aliri_silent::IdTokenRef,
//! #         _expectations: &aliri_silent::validate::TokenExpectations,
//! #     ) -> Result<aliri_silent::validate::IdTokenClaims, Box<dyn std::error::Error + Send + Sync>> {
//! #         unimplemented!()
//! #     }
//! # }
//! #
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ClientOptions::new(
//!     "https://issuer.example.com/authorize".parse()?,
//!     "https://issuer.example.com/oauth/token".parse()?,
//!     ClientId::new("my_client"),
//!     "https://app.example.com/callback".parse()?,
//!     jwt::Issuer::new("https://issuer.example.com/"),
//! )
//! .with_refresh_tokens(true);
//!
//! let client = SilentClient::builder(
//!     options,
//!     Arc::new(MyAuthorizeChannel),
//!     Arc::new(MyVerifier),
//! )
//! .build();
//!
//! let tokens = client.get_token_silently(GetTokenOptions::default()).await?;
//!
//! tracing::info!(
//!     token = format_args!("{:#?}", tokens.access_token()),
//!     "obtained access token"
//! );
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod authorize;
mod braids;
pub mod cache;
pub mod client;
mod error;
mod exchange;
pub mod lock;
pub mod markers;
pub mod pkce;
mod scope;
mod tokens;
pub mod validate;
mod worker;

pub use braids::*;
pub use cache::{CacheEntry, Fingerprint, CACHE_LEEWAY, DEFAULT_AUDIENCE};
pub use client::{ClientOptions, GetTokenOptions, SilentClient, SilentClientBuilder};
pub use error::SilentTokenError;
pub use scope::*;
pub use tokens::TokenSet;
