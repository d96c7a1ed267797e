use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use moka::future::Cache;
use reqwest::Client;
use tokio::sync::Mutex;
use tower::{
    buffer::BufferLayer, util::BoxCloneService, BoxError, Layer, Service, ServiceBuilder,
    ServiceExt,
};
use tower_layer::layer_fn;
use tracing::instrument;
use url::Url;

use crate::error::KeyFetchError;
use crate::key_set::{JwkSetDocument, SigningKey, StaticKeySet};
use crate::oidc::OidcProvider;

/// How long a fetched key set is trusted before it is fetched again, even on a cache hit.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);

/// Delay before the single retry of a failed fetch.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const CACHE_KEY: &str = "key_set";

type FetchService = BoxCloneService<(), JwkSetDocument, KeyFetchError>;

struct RateLimitConfig {
    num: u64,
    per: Duration,
}

/// Builder for configuring a `RemoteKeySet`.
pub struct RemoteKeySetBuilder {
    url: Url,
    max_age: Duration,
    retry_backoff: Duration,
    timeout: Duration,
    rate_limit_config: Option<RateLimitConfig>,
}

impl RemoteKeySetBuilder {
    /// Creates a new builder with the given JWKS URL.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            max_age: DEFAULT_MAX_AGE,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            timeout: DEFAULT_TIMEOUT,
            rate_limit_config: None,
        }
    }

    /// Bounds how long a fetched key set is used before it is fetched again.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allows at most `num` requests to the JWKS endpoint per `per`. Further refreshes wait for the next window.
    pub fn with_rate_limit(mut self, num: u64, per: Duration) -> Self {
        self.rate_limit_config = Some(RateLimitConfig { num, per });
        self
    }

    /// Builds the `RemoteKeySet` with the configured options.
    ///
    /// With a rate limit configured, this must be called from within a Tokio runtime.
    pub fn build(self) -> RemoteKeySet {
        let http_client = Client::builder()
            .timeout(self.timeout)
            .build()
            .unwrap_or_else(|error| {
                tracing::warn!(
                    target: "casting_auth::key_set",
                    error = %error,
                    "Failed to build HTTP client with custom config, using defaults"
                );
                Client::new()
            });
        let request_service = KeySetRequestService {
            http_client,
            url: self.url.clone(),
        };

        let rate_limit_layer = self.rate_limit_config.map(|rate_limit_config| {
            layer_fn(move |inner| {
                let rate_limit =
                    tower::limit::RateLimitLayer::new(rate_limit_config.num, rate_limit_config.per);
                let rate_limited_service = rate_limit.layer(inner);

                // Wrap the rate limited service in another buffer service to make it `Clone`.
                let buffered_service = BufferLayer::new(1024).layer(rate_limited_service);

                buffered_service.map_err(|error: BoxError| match error.downcast::<KeyFetchError>() {
                    Ok(error) => *error,
                    Err(_) => KeyFetchError::Unavailable,
                })
            })
        });

        let service_tower = ServiceBuilder::new()
            .option_layer(rate_limit_layer)
            .service(request_service);

        let cache = Cache::builder()
            .max_capacity(1)
            .time_to_live(self.max_age)
            .build();

        RemoteKeySet {
            url: self.url,
            cache,
            fetcher: Arc::new(Mutex::new(Fetcher {
                service: BoxCloneService::new(service_tower),
                last_attempt: None,
            })),
            retry_backoff: self.retry_backoff,
        }
    }
}

/// Key set fetched on demand from the identity provider's JWKS endpoint.
///
/// The fetched set is cached for its max age. A lookup of a `kid` missing from the cache triggers one refresh, so
/// newly rotated keys are picked up without waiting for expiry. Concurrent refreshes are coalesced: callers queue
/// behind the in-flight fetch and reuse its outcome, success or failure, instead of fetching again. Clones share cache
/// and fetcher.
#[derive(Clone)]
pub struct RemoteKeySet {
    url: Url,
    cache: Cache<&'static str, StaticKeySet>,
    fetcher: Arc<Mutex<Fetcher>>,
    retry_backoff: Duration,
}

/// The fetch pipeline together with the outcome of its most recent refresh.
struct Fetcher {
    service: FetchService,
    last_attempt: Option<RefreshAttempt>,
}

struct RefreshAttempt {
    completed_at: Instant,
    outcome: Result<StaticKeySet, KeyFetchError>,
}

impl RemoteKeySet {
    /// Creates a builder for configuring a `RemoteKeySet`.
    pub fn builder(url: Url) -> RemoteKeySetBuilder {
        RemoteKeySetBuilder::new(url)
    }

    /// Creates a builder for the JWKS endpoint advertised by `issuer`'s OpenID configuration.
    pub async fn discover(issuer: Url) -> Result<RemoteKeySetBuilder, KeyFetchError> {
        let jwks_uri = OidcProvider::new(issuer).jwks_uri().await?;
        Ok(RemoteKeySetBuilder::new(jwks_uri))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Looks up `kid`, refreshing the cached set at most once.
    ///
    /// `Ok(None)` means the key is absent from a set fetched no earlier than this call.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn get_key(&self, kid: &str) -> Result<Option<SigningKey>, KeyFetchError> {
        let requested_at = Instant::now();

        if let Some(cached) = self.cache.get(&CACHE_KEY).await {
            if let Some(key) = cached.get(kid) {
                tracing::debug!(target: "casting_auth::key_set", "JWK set cache hit");
                return Ok(Some(key.clone()));
            }
            tracing::debug!(target: "casting_auth::key_set", "Key not found in cached JWK set");
        }

        let refreshed = self.refresh(requested_at).await?;
        let key = refreshed.get(kid).cloned();
        if key.is_none() {
            tracing::warn!(target: "casting_auth::key_set", "Key not found in JWK set after refresh");
        }
        Ok(key)
    }

    /// Populates the cache ahead of the first request.
    pub async fn prefetch(&self) -> Result<StaticKeySet, KeyFetchError> {
        self.refresh(Instant::now()).await
    }

    /// The currently cached keys, if any and not past their max age. Never fetches.
    pub async fn cached(&self) -> Option<StaticKeySet> {
        self.cache.get(&CACHE_KEY).await
    }

    /// Returns the outcome of a refresh completed no earlier than `requested_at`, refreshing if there is none.
    async fn refresh(&self, requested_at: Instant) -> Result<StaticKeySet, KeyFetchError> {
        let cache = self.cache.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let retry_backoff = self.retry_backoff;

        // Detached, so that an aborted request neither cancels the fetch nor loses its result.
        let refresh = tokio::spawn(refresh_coalesced(cache, fetcher, retry_backoff, requested_at));

        refresh.await.map_err(|error| {
            tracing::error!(target: "casting_auth::key_set", error = %error, "JWK set refresh task failed");
            KeyFetchError::RefreshAborted
        })?
    }
}

impl fmt::Debug for RemoteKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteKeySet")
            .field("url", &self.url.as_str())
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

async fn refresh_coalesced(
    cache: Cache<&'static str, StaticKeySet>,
    fetcher: Arc<Mutex<Fetcher>>,
    retry_backoff: Duration,
    requested_at: Instant,
) -> Result<StaticKeySet, KeyFetchError> {
    let mut fetcher = fetcher.lock_owned().await;

    // An attempt completed after this refresh was requested was in flight while it queued.
    if let Some(attempt) = fetcher
        .last_attempt
        .as_ref()
        .filter(|attempt| attempt.completed_at >= requested_at)
    {
        tracing::debug!(
            target: "casting_auth::key_set",
            succeeded = attempt.outcome.is_ok(),
            "Reusing outcome of concurrent JWK set refresh"
        );
        return attempt.outcome.clone();
    }

    let outcome = fetch_with_retry(&mut fetcher.service, retry_backoff)
        .await
        .map(StaticKeySet::from_document);
    if let Ok(keys) = &outcome {
        cache.insert(CACHE_KEY, keys.clone()).await;
        tracing::info!(
            target: "casting_auth::key_set",
            key_count = keys.len(),
            "JWK set cache refreshed"
        );
    }

    fetcher.last_attempt = Some(RefreshAttempt {
        completed_at: Instant::now(),
        outcome: outcome.clone(),
    });
    outcome
}

/// Fetches the key set, retrying a failed fetch once after `retry_backoff`.
async fn fetch_with_retry(
    fetcher: &mut FetchService,
    retry_backoff: Duration,
) -> Result<JwkSetDocument, KeyFetchError> {
    match fetch(fetcher).await {
        Ok(document) => Ok(document),
        Err(error) => {
            tracing::warn!(
                target: "casting_auth::key_set",
                error = %error,
                "Failed to fetch JWK set, retrying once"
            );
            tokio::time::sleep(retry_backoff).await;
            fetch(fetcher).await.map_err(|error| {
                tracing::error!(target: "casting_auth::key_set", error = %error, "Failed to fetch JWK set");
                error
            })
        }
    }
}

async fn fetch(fetcher: &mut FetchService) -> Result<JwkSetDocument, KeyFetchError> {
    fetcher.ready().await?.call(()).await
}

/// Helper service wrapping a `reqwest::Client` to fetch a JWK set from a given URL.
#[derive(Clone)]
struct KeySetRequestService {
    http_client: Client,
    url: Url,
}

impl Service<()> for KeySetRequestService {
    type Response = JwkSetDocument;
    type Error = KeyFetchError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        let http_client = self.http_client.clone();
        let url = self.url.clone();
        Box::pin(async move {
            tracing::debug!(target: "casting_auth::key_set", url = %url, "Fetching JWK set");
            let response = http_client.get(url).send().await?;

            if !response.status().is_success() {
                return Err(KeyFetchError::ErrorResponse {
                    status_code: response.status(),
                });
            }

            response
                .json::<JwkSetDocument>()
                .await
                .map_err(KeyFetchError::invalid_document)
        })
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use url::Url;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::RemoteKeySet;
    use crate::error::KeyFetchError;
    use crate::test_support::{jwks, primary_key, rotated_key};

    const JWKS_PATH: &str = "/.well-known/jwks.json";

    async fn mock_jwks(server: &MockServer, body: serde_json::Value, times: u64) {
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(times)
            .mount(server)
            .await;
    }

    fn jwks_url(server: &MockServer) -> Url {
        Url::parse(&server.uri()).unwrap().join(JWKS_PATH).unwrap()
    }

    fn remote_key_set(server: &MockServer) -> RemoteKeySet {
        RemoteKeySet::builder(jwks_url(server))
            .with_retry_backoff(Duration::from_millis(10))
            .build()
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.unwrap().len()
    }

    #[tokio::test]
    async fn test_fetches_once_and_serves_from_cache() {
        let server = MockServer::start().await;
        mock_jwks(&server, jwks(&[primary_key()]), 1).await;
        let key_set = remote_key_set(&server);

        for _ in 0..3 {
            let key = key_set.get_key(primary_key().kid()).await.unwrap();
            assert_eq!(key.unwrap().key_id(), primary_key().kid());
        }
    }

    #[tokio::test]
    async fn test_unknown_kid_on_cold_cache_fetches_once() {
        let server = MockServer::start().await;
        mock_jwks(&server, jwks(&[primary_key()]), 1).await;

        assert!(remote_key_set(&server).get_key("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_kid_on_warm_cache_refreshes_exactly_once() {
        let server = MockServer::start().await;
        mock_jwks(&server, jwks(&[primary_key()]), 2).await;
        let key_set = remote_key_set(&server);

        assert!(key_set.get_key(primary_key().kid()).await.unwrap().is_some());
        assert!(key_set.get_key("unknown").await.unwrap().is_none());
        assert_eq!(request_count(&server).await, 2);
    }

    #[tokio::test]
    async fn test_rotated_key_is_picked_up_by_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks(&[primary_key()])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mock_jwks(&server, jwks(&[primary_key(), rotated_key()]), 1).await;
        let key_set = remote_key_set(&server);

        assert!(key_set.get_key(primary_key().kid()).await.unwrap().is_some());
        let rotated = key_set.get_key(rotated_key().kid()).await.unwrap();
        assert_eq!(rotated.unwrap().key_id(), rotated_key().kid());
        assert!(key_set.get_key(rotated_key().kid()).await.unwrap().is_some());
        assert_eq!(request_count(&server).await, 2);
    }

    #[tokio::test]
    async fn test_max_age_forces_refresh_on_cache_hit() {
        let server = MockServer::start().await;
        mock_jwks(&server, jwks(&[primary_key()]), 2).await;
        let key_set = RemoteKeySet::builder(jwks_url(&server))
            .with_max_age(Duration::from_millis(200))
            .build();

        assert!(key_set.get_key(primary_key().kid()).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(key_set.cached().await.is_none());
        assert!(key_set.get_key(primary_key().kid()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(jwks(&[primary_key()]))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let key_set = remote_key_set(&server);

        let lookups = (0..16).map(|_| {
            let key_set = key_set.clone();
            tokio::spawn(async move { key_set.get_key(primary_key().kid()).await })
        });
        for lookup in futures::future::join_all(lookups).await {
            assert!(lookup.unwrap().unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_during_outage_share_one_failed_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(100)))
            .mount(&server)
            .await;
        let key_set = RemoteKeySet::builder(jwks_url(&server))
            .with_retry_backoff(Duration::from_millis(50))
            .build();

        let started = Instant::now();
        let lookups = (0..16).map(|_| {
            let key_set = key_set.clone();
            tokio::spawn(async move { key_set.get_key("any").await })
        });
        for lookup in futures::future::join_all(lookups).await {
            let error = lookup.unwrap().unwrap_err();
            assert!(matches!(
                error,
                KeyFetchError::ErrorResponse { status_code } if status_code == 500
            ));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(request_count(&server).await, 2);

        // A lookup starting after the failed refresh completed fetches again.
        assert!(key_set.get_key("any").await.is_err());
        assert_eq!(request_count(&server).await, 4);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mock_jwks(&server, jwks(&[primary_key()]), 1).await;

        let key = remote_key_set(&server).get_key(primary_key().kid()).await.unwrap();
        assert!(key.is_some());
        assert_eq!(request_count(&server).await, 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_reported_after_one_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let error = remote_key_set(&server)
            .get_key(primary_key().kid())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            KeyFetchError::ErrorResponse { status_code } if status_code == 500
        ));
        assert_eq!(
            crate::Error::from(error).kind(),
            crate::ErrorKind::KeyFetchTransientFailure
        );
    }

    #[tokio::test]
    async fn test_invalid_document_is_a_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(2)
            .mount(&server)
            .await;

        let error = remote_key_set(&server).get_key("any").await.unwrap_err();
        assert!(matches!(error, KeyFetchError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_prefetch_populates_cache() {
        let server = MockServer::start().await;
        mock_jwks(&server, jwks(&[primary_key(), rotated_key()]), 1).await;
        let key_set = remote_key_set(&server);

        assert!(key_set.cached().await.is_none());
        let prefetched = key_set.prefetch().await.unwrap();
        assert_eq!(prefetched.len(), 2);
        assert!(key_set.get_key(rotated_key().kid()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_aborted_lookup_still_populates_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(jwks(&[primary_key()]))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let key_set = remote_key_set(&server);

        let lookup = {
            let key_set = key_set.clone();
            tokio::spawn(async move { key_set.get_key(primary_key().kid()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        lookup.abort();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let cached = key_set.cached().await.unwrap();
        assert!(cached.get(primary_key().kid()).is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_delays_back_to_back_refreshes() {
        let server = MockServer::start().await;
        mock_jwks(&server, jwks(&[primary_key()]), 2).await;
        let key_set = RemoteKeySet::builder(jwks_url(&server))
            .with_rate_limit(1, Duration::from_millis(300))
            .build();

        let started = Instant::now();
        assert!(key_set.get_key("first-unknown").await.unwrap().is_none());
        assert!(key_set.get_key("second-unknown").await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
