//! Authorization configuration.
//!
//! Configuration is loaded from environment variables. Only the issuer and audience are required.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use thiserror::Error;
use url::Url;

use crate::claims::DEFAULT_PERMISSIONS_CLAIM;
use crate::key_set::is_asymmetric;
use crate::oidc::well_known_url;
use crate::remote_key_set::{DEFAULT_MAX_AGE, DEFAULT_RETRY_BACKOFF};
use crate::signature::DEFAULT_ALGORITHMS;

/// Default clock skew tolerance in seconds.
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 0;

/// Upper bound on the clock skew tolerance in seconds.
pub const MAX_CLOCK_SKEW_SECONDS: u64 = 600;

/// Conventional JWKS location relative to the issuer.
pub const DEFAULT_JWKS_PATH: &str = ".well-known/jwks.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Expected `iss` claim, compared exactly.
    pub issuer: String,

    /// Expected member of the `aud` claim.
    pub audience: String,

    /// JWKS endpoint (default: `<issuer>.well-known/jwks.json`).
    pub jwks_url: Url,

    /// Accepted signature algorithms (default: RS256).
    pub algorithms: Vec<Algorithm>,

    /// Tolerance for `exp`, `iat` and `nbf` checks.
    pub clock_skew_seconds: u64,

    /// How long a fetched key set is used before it is fetched again.
    pub jwks_max_age: Duration,

    /// Delay before retrying a failed key set fetch.
    pub jwks_retry_backoff: Duration,

    /// Maximum key set fetches per minute (default: unlimited).
    /// Bounds the refreshes clients can force by presenting unknown key IDs.
    pub jwks_rate_limit_rpm: Option<u64>,

    /// Name of the claim holding the permission set.
    pub permissions_claim: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid issuer configuration: {0}")]
    InvalidIssuer(String),

    #[error("Invalid JWKS URL configuration: {0}")]
    InvalidJwksUrl(String),

    #[error("Invalid algorithm configuration: {0}")]
    InvalidAlgorithms(String),

    #[error("Invalid clock skew configuration: {0}")]
    InvalidClockSkew(String),

    #[error("Invalid JWKS cache configuration: {0}")]
    InvalidJwksCache(String),

    #[error("Invalid JWKS rate limit configuration: {0}")]
    InvalidJwksRateLimit(String),
}

impl AuthConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        // An explicit issuer wins over the Auth0 tenant domain.
        let issuer = match (vars.get("AUTH_ISSUER"), vars.get("AUTH0_DOMAIN")) {
            (Some(issuer), _) => issuer.clone(),
            (None, Some(domain)) => format!("https://{}/", domain.trim_end_matches('/')),
            (None, None) => {
                return Err(ConfigError::MissingEnvVar(
                    "AUTH0_DOMAIN or AUTH_ISSUER".to_string(),
                ))
            }
        };
        let issuer_url = Url::parse(&issuer).map_err(|e| {
            ConfigError::InvalidIssuer(format!("issuer must be an absolute URL, got '{}': {}", issuer, e))
        })?;

        let audience = vars
            .get("API_AUDIENCE")
            .ok_or_else(|| ConfigError::MissingEnvVar("API_AUDIENCE".to_string()))?
            .clone();

        let jwks_url = match vars.get("AUTH_JWKS_URL") {
            Some(value_str) => Url::parse(value_str),
            None => well_known_url(&issuer_url, DEFAULT_JWKS_PATH),
        }
        .map_err(|e| ConfigError::InvalidJwksUrl(e.to_string()))?;

        let algorithms = match vars.get("AUTH_ALGORITHMS") {
            Some(value_str) => parse_algorithms(value_str)?,
            None => DEFAULT_ALGORITHMS.to_vec(),
        };

        let clock_skew_seconds = if let Some(value_str) = vars.get("AUTH_CLOCK_SKEW_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidClockSkew(format!(
                    "AUTH_CLOCK_SKEW_SECONDS must be a valid non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value > MAX_CLOCK_SKEW_SECONDS {
                return Err(ConfigError::InvalidClockSkew(format!(
                    "AUTH_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW_SECONDS, value
                )));
            }

            value
        } else {
            DEFAULT_CLOCK_SKEW_SECONDS
        };

        let jwks_max_age = if let Some(value_str) = vars.get("AUTH_JWKS_MAX_AGE_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwksCache(format!(
                    "AUTH_JWKS_MAX_AGE_SECONDS must be a valid positive integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidJwksCache(
                    "AUTH_JWKS_MAX_AGE_SECONDS must be greater than 0".to_string(),
                ));
            }

            Duration::from_secs(value)
        } else {
            DEFAULT_MAX_AGE
        };

        let jwks_retry_backoff = if let Some(value_str) = vars.get("AUTH_JWKS_RETRY_BACKOFF_MS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwksCache(format!(
                    "AUTH_JWKS_RETRY_BACKOFF_MS must be a valid non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?;
            Duration::from_millis(value)
        } else {
            DEFAULT_RETRY_BACKOFF
        };

        let jwks_rate_limit_rpm = if let Some(value_str) = vars.get("AUTH_JWKS_RATE_LIMIT_RPM") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwksRateLimit(format!(
                    "AUTH_JWKS_RATE_LIMIT_RPM must be a valid positive integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidJwksRateLimit(
                    "AUTH_JWKS_RATE_LIMIT_RPM must be greater than 0".to_string(),
                ));
            }

            Some(value)
        } else {
            None
        };

        let permissions_claim = vars
            .get("AUTH_PERMISSIONS_CLAIM")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PERMISSIONS_CLAIM.to_string());

        Ok(Self {
            issuer,
            audience,
            jwks_url,
            algorithms,
            clock_skew_seconds,
            jwks_max_age,
            jwks_retry_backoff,
            jwks_rate_limit_rpm,
            permissions_claim,
        })
    }
}

fn parse_algorithms(value_str: &str) -> Result<Vec<Algorithm>, ConfigError> {
    let algorithms = value_str
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            let algorithm = Algorithm::from_str(name).map_err(|_| {
                ConfigError::InvalidAlgorithms(format!("unknown algorithm '{}'", name))
            })?;
            if !is_asymmetric(algorithm) {
                return Err(ConfigError::InvalidAlgorithms(format!(
                    "symmetric algorithm '{}' cannot verify provider-signed tokens",
                    name
                )));
            }
            Ok(algorithm)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if algorithms.is_empty() {
        return Err(ConfigError::InvalidAlgorithms(
            "AUTH_ALGORITHMS must name at least one algorithm".to_string(),
        ));
    }
    Ok(algorithms)
}
