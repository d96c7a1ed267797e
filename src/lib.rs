//! Bearer-token authorization [middleware for `axum`](https://docs.rs/axum/latest/axum/middleware/index.html), checking
//! [JSON Web Tokens (JWT)](https://datatracker.ietf.org/doc/html/rfc7519) issued by an OpenID Connect provider such as
//! Auth0 against the permissions each route requires.
//!
//! ## Overview
//!
//! Every request to a protected route goes through the same sequence of checks, stopping at the first failure:
//!
//! 1. The `Authorization: Bearer <token>` header is extracted.
//! 2. The token is split into its header, payload and signature and decoded.
//! 3. The signature is verified with the provider key named by the token's `kid`, using only allowlisted asymmetric
//!    algorithms.
//! 4. The issuer, audience, expiry, issued-at and not-before claims are validated against an explicit `now`.
//! 5. The token's `permissions` claim must contain the permission the route requires.
//!
//! Failures render as a uniform `401 Unauthorized` whose body carries a stable, machine-readable `error_kind`. When the
//! provider's keys cannot be fetched the response is `503 Service Unavailable` instead, since retrying may succeed.
//!
//! ## Features
//!
//! - **Key Rotation**: The provider's JWK set is fetched on demand and cached. A token signed with a key ID (`kid`)
//!   missing from the cache triggers exactly one refresh, so rotated keys are picked up immediately.
//! - **Caching**: Cached key sets expire after a configurable max age, bounding how long a revoked key is trusted.
//! - **Coalescing**: Concurrent requests missing the cache share a single in-flight fetch. Fetches run detached from
//!   the request, so an aborted request still populates the cache.
//! - **Rate Limiting**: Outgoing requests to the JWK set endpoint can be rate limited to stay clear of provider-side
//!   limits.
//! - **Discovery**: The JWK set URL can be read from the provider's `.well-known/openid-configuration`.
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use axum::{routing::get, Extension, Router};
//! use casting_auth::{permission::casting, AuthConfig, AuthorizationLayer, Authorizer, Claims};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads `AUTH0_DOMAIN` and `API_AUDIENCE`, among others, from the environment.
//!     let authorizer = Arc::new(Authorizer::from_config(&AuthConfig::from_env()?));
//!
//!     let router = Router::new()
//!         .route(
//!             "/actors",
//!             get(|Extension(claims): Extension<Claims>| async move {
//!                 format!("Hello {}!", claims.subject())
//!             })
//!             .route_layer(AuthorizationLayer::new(Arc::clone(&authorizer), casting::GET_ACTORS)),
//!         )
//!         .route(
//!             "/movies",
//!             get(|| async { "[]" })
//!                 .route_layer(AuthorizationLayer::new(authorizer, casting::GET_MOVIES)),
//!         );
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```
//!
//! [`Authorizer`] can also be used without the layer, e.g. to check permissions from within a handler.

pub mod authorization;
pub mod claims;
pub mod config;
pub mod key_set;
pub mod oidc;
pub mod permission;
pub mod signature;
pub mod token;

pub use authorization::{AuthDecision, AuthorizationLayer, Authorizer};
pub use claims::Claims;
pub use config::AuthConfig;
pub use error::{Error, ErrorKind, KeyFetchError};
pub use key_set::KeySet;
pub use remote_key_set::{RemoteKeySet, RemoteKeySetBuilder};

mod error;
mod remote_key_set;

#[cfg(test)]
mod test_support;
