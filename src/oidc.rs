//! OpenID Connect discovery of the identity provider's JWKS endpoint.
//!
//! Providers do not agree on where they publish their keys (`/.well-known/jwks.json` on Auth0, `/v1/keys` on Okta), so
//! the standard way is to read `jwks_uri` from the provider metadata at `/.well-known/openid-configuration`.

use http_cache_reqwest::{Cache, CacheMode, HttpCache, HttpCacheOptions, MokaManager};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::KeyFetchError;
use crate::key_set::{JwkSetDocument, StaticKeySet};

pub const OIDC_CONFIGURATION_ENDPOINT: &str = ".well-known/openid-configuration";

/// Resolves `document` relative to `issuer`, treating the issuer as a directory even without a trailing slash.
pub fn well_known_url(issuer: &Url, document: &str) -> Result<Url, url::ParseError> {
    let mut base = issuer.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(document)
}

/// Reads the JWKS URL advertised by `issuer`.
pub async fn discover_jwks_uri(issuer: Url) -> Result<Url, KeyFetchError> {
    OidcProvider::new(issuer).jwks_uri().await
}

pub struct OidcProvider {
    issuer_url: Url,
    http_client: ClientWithMiddleware,
}

impl OidcProvider {
    pub fn new(issuer_url: Url) -> Self {
        // Honors the provider's cache headers, so repeated discovery does not hit the network.
        let http_client = ClientBuilder::new(Client::new())
            .with(Cache(HttpCache {
                mode: CacheMode::Default,
                manager: MokaManager::default(),
                options: HttpCacheOptions::default(),
            }))
            .build();

        Self {
            issuer_url,
            http_client,
        }
    }

    pub fn issuer(&self) -> &Url {
        &self.issuer_url
    }

    pub async fn configuration(&self) -> Result<OpenIdConfiguration, KeyFetchError> {
        let configuration_url = well_known_url(&self.issuer_url, OIDC_CONFIGURATION_ENDPOINT)?;
        tracing::debug!(
            target: "casting_auth::oidc",
            url = %configuration_url,
            "Fetching OpenID configuration"
        );

        let response = self.http_client.get(configuration_url).send().await?;
        if !response.status().is_success() {
            return Err(KeyFetchError::ErrorResponse {
                status_code: response.status(),
            });
        }

        let configuration = response
            .json::<OpenIdConfiguration>()
            .await
            .map_err(KeyFetchError::invalid_configuration)?;

        if let Some(advertised) = &configuration.issuer {
            if advertised.trim_end_matches('/') != self.issuer_url.as_str().trim_end_matches('/') {
                tracing::warn!(
                    target: "casting_auth::oidc",
                    issuer = %self.issuer_url,
                    advertised_issuer = %advertised,
                    "OpenID configuration advertises a different issuer"
                );
            }
        }
        Ok(configuration)
    }

    pub async fn jwks_uri(&self) -> Result<Url, KeyFetchError> {
        let configuration = self.configuration().await?;
        Ok(Url::parse(&configuration.jwks_uri)?)
    }

    /// Fetches the provider's current keys once, for use as a local key set.
    pub async fn key_set(&self) -> Result<StaticKeySet, KeyFetchError> {
        let jwks_uri = self.jwks_uri().await?;

        let response = self.http_client.get(jwks_uri).send().await?;
        if !response.status().is_success() {
            return Err(KeyFetchError::ErrorResponse {
                status_code: response.status(),
            });
        }

        let document = response
            .json::<JwkSetDocument>()
            .await
            .map_err(KeyFetchError::invalid_document)?;
        Ok(StaticKeySet::from_document(document))
    }
}

/// Response payload of the OpenID provider's `.well-known/openid-configuration` endpoint.
///
/// Only covers those fields that are relevant in our context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenIdConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// The URI where to retrieve the OIDC provider's signing keys.
    pub jwks_uri: String,
}
