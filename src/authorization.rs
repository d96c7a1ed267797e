//! Bearer-token authorization of incoming requests.
//!
//! A request moves through [`AuthStage`]s in order and is rejected at the first failing stage. Later stages never run
//! after a failure, so a rejection reveals nothing about checks the token would or would not have passed.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use futures::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use tower::Layer;
use tower_service::Service;
use tracing::instrument;

use crate::claims::{self, Claims, ClaimsRules};
use crate::config::AuthConfig;
use crate::key_set::KeySet;
use crate::permission;
use crate::remote_key_set::RemoteKeySet;
use crate::signature::SignatureVerifier;
use crate::token::RawToken;
use crate::Error;

/// States of the authorization of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    Unauthenticated,
    TokenExtracted,
    SignatureVerified,
    ClaimsValidated,
    PermissionChecked,
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthStage::Unauthenticated => "unauthenticated",
            AuthStage::TokenExtracted => "token_extracted",
            AuthStage::SignatureVerified => "signature_verified",
            AuthStage::ClaimsValidated => "claims_validated",
            AuthStage::PermissionChecked => "permission_checked",
        };
        f.write_str(name)
    }
}

/// Outcome of authorizing one request.
#[derive(Debug)]
pub enum AuthDecision {
    Allowed(Claims),
    Denied(Error),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allowed(_))
    }

    /// Status the request is rejected with, `None` if it is allowed.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            AuthDecision::Allowed(_) => None,
            AuthDecision::Denied(error) => Some(error.status_code()),
        }
    }

    pub fn into_result(self) -> Result<Claims, Error> {
        match self {
            AuthDecision::Allowed(claims) => Ok(claims),
            AuthDecision::Denied(error) => Err(error),
        }
    }
}

impl From<Result<Claims, Error>> for AuthDecision {
    fn from(result: Result<Claims, Error>) -> Self {
        match result {
            Ok(claims) => AuthDecision::Allowed(claims),
            Err(error) => AuthDecision::Denied(error),
        }
    }
}

/// Decides whether a request's bearer token grants a permission.
///
/// Independent of HTTP routing, so it can be called from any handler. [`AuthorizationLayer`] wraps it as middleware.
#[derive(Debug, Clone)]
pub struct Authorizer {
    key_set: KeySet,
    verifier: SignatureVerifier,
    rules: ClaimsRules,
}

impl Authorizer {
    /// Creates an authorizer accepting RS256 tokens signed by a key in `key_set`.
    pub fn new(key_set: impl Into<KeySet>, rules: ClaimsRules) -> Self {
        Self {
            key_set: key_set.into(),
            verifier: SignatureVerifier::default(),
            rules,
        }
    }

    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Creates an authorizer fetching keys from the configured JWKS endpoint.
    ///
    /// With a JWKS rate limit configured, this must be called from within a Tokio runtime.
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut key_set = RemoteKeySet::builder(config.jwks_url.clone())
            .with_max_age(config.jwks_max_age)
            .with_retry_backoff(config.jwks_retry_backoff);
        if let Some(rpm) = config.jwks_rate_limit_rpm {
            key_set = key_set.with_rate_limit(rpm, Duration::from_secs(60));
        }
        let key_set = key_set.build();
        let rules = ClaimsRules::new(config.issuer.clone(), config.audience.clone())
            .with_leeway(config.clock_skew_seconds)
            .with_permissions_claim(config.permissions_claim.clone());

        tracing::info!(
            target: "casting_auth::authorization",
            issuer = %config.issuer,
            jwks_url = %config.jwks_url,
            "Authorizer configured"
        );
        Self::new(key_set, rules).with_verifier(SignatureVerifier::new(config.algorithms.iter().copied()))
    }

    pub fn key_set(&self) -> &KeySet {
        &self.key_set
    }

    pub fn rules(&self) -> &ClaimsRules {
        &self.rules
    }

    /// Authorizes the request carrying `headers` for `required_permission`, at the current time.
    pub async fn authorize(&self, headers: &HeaderMap, required_permission: &str) -> AuthDecision {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.authorize_at(headers, required_permission, now).await
    }

    /// Authorizes the request carrying `headers` for `required_permission`, as of `now` (seconds since the epoch).
    #[instrument(skip(self, headers))]
    pub async fn authorize_at(&self, headers: &HeaderMap, required_permission: &str, now: u64) -> AuthDecision {
        let decision = AuthDecision::from(self.check(headers, required_permission, now).await);

        match &decision {
            AuthDecision::Allowed(_) => tracing::debug!(
                target: "casting_auth::authorization",
                stage = %AuthStage::PermissionChecked,
                "Request authorized"
            ),
            AuthDecision::Denied(error) => tracing::debug!(
                target: "casting_auth::authorization",
                stage = %error.stage(),
                error_kind = %error.kind(),
                error = %error,
                "Request rejected"
            ),
        }
        decision
    }

    /// Verifies `token` and validates its claims, without checking any permission.
    pub async fn authenticate(&self, token: &str, now: u64) -> Result<Claims, Error> {
        let raw = RawToken::parse(token)?;
        let verified = self.verifier.verify(raw, &self.key_set).await?;
        Ok(claims::validate(&verified, &self.rules, now)?)
    }

    async fn check(&self, headers: &HeaderMap, required_permission: &str, now: u64) -> Result<Claims, Error> {
        let credentials = bearer_credentials(headers)?;
        let claims = self.authenticate(credentials.token(), now).await?;
        permission::enforce(&claims, required_permission)?;
        Ok(claims)
    }
}

/// Extracts the `Authorization: Bearer <token>` credentials.
fn bearer_credentials(headers: &HeaderMap) -> Result<Authorization<Bearer>, Error> {
    let credentials = headers
        .typed_try_get::<Authorization<Bearer>>()
        .map_err(|_| Error::MalformedAuthHeader)?
        .ok_or(Error::MissingAuthHeader)?;

    if credentials.token().trim().is_empty() {
        return Err(Error::MalformedAuthHeader);
    }
    Ok(credentials)
}

/// Middleware requiring a permission for every request to the wrapped routes.
///
/// On success the request's [`Claims`] are available to handlers as `Extension<Claims>`. On failure the inner service
/// is not called and the rejection is rendered as described on [`Error`].
#[derive(Clone)]
pub struct AuthorizationLayer {
    authorizer: Arc<Authorizer>,
    permission: Arc<str>,
}

impl AuthorizationLayer {
    pub fn new(authorizer: Arc<Authorizer>, permission: impl Into<Arc<str>>) -> Self {
        Self {
            authorizer,
            permission: permission.into(),
        }
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }
}

impl<S> Layer<S> for AuthorizationLayer {
    type Service = AuthorizationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthorizationService {
            inner,
            authorizer: Arc::clone(&self.authorizer),
            permission: Arc::clone(&self.permission),
        }
    }
}

#[derive(Clone)]
pub struct AuthorizationService<S> {
    inner: S,
    authorizer: Arc<Authorizer>,
    permission: Arc<str>,
}

impl<S> Service<Request> for AuthorizationService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Move the original service into the closure instead of its clone. This makes sure that the original service is
        // `call`ed instead of the cloned one, which might not be ready yet (`poll_ready` hasn't been called on the
        // clone yet).
        // See [docs](https://docs.rs/tower/latest/tower/trait.Service.html#be-careful-when-cloning-inner-services).
        let inner_clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner_clone);

        let authorizer = Arc::clone(&self.authorizer);
        let permission = Arc::clone(&self.permission);
        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            match authorizer.authorize(&parts.headers, &permission).await {
                AuthDecision::Allowed(claims) => {
                    parts.extensions.insert(claims);
                    inner.call(Request::from_parts(parts, body)).await
                }
                AuthDecision::Denied(error) => Ok(error.into_response()),
            }
        })
    }
}
