//! Signature verification against the identity provider's keys.
//!
//! The accepted algorithms are an explicit allowlist. The token's `alg` header is only ever checked against it and
//! never used to pick a verification strategy on its own, so a token declaring `none` or an HMAC algorithm is refused
//! before any key is looked up.

use std::str::FromStr;

use jsonwebtoken::Algorithm;
use serde_json::{Map, Value};

use crate::key_set::{is_asymmetric, KeySet, SigningKey};
use crate::token::RawToken;
use crate::Error;

/// Algorithms accepted when none are configured.
pub const DEFAULT_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("token algorithm `{}` is not accepted", .alg.as_deref().unwrap_or("<missing>"))]
    UnsupportedAlgorithm { alg: Option<String> },
    #[error("token signing key `{}` is unknown", .kid.as_deref().unwrap_or("<missing>"))]
    UnknownKey { kid: Option<String> },
    #[error("token signature does not match")]
    SignatureMismatch,
}

/// A token whose signature has been checked. Its payload is trusted but its claims are not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken {
    payload: Map<String, Value>,
    key_id: String,
    algorithm: Algorithm,
}

impl VerifiedToken {
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    allowed_algorithms: Vec<Algorithm>,
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self {
            allowed_algorithms: DEFAULT_ALGORITHMS.to_vec(),
        }
    }
}

impl SignatureVerifier {
    /// Creates a verifier accepting `algorithms`. Symmetric algorithms are dropped.
    pub fn new(algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        let allowed_algorithms = algorithms
            .into_iter()
            .filter(|alg| {
                let asymmetric = is_asymmetric(*alg);
                if !asymmetric {
                    tracing::warn!(
                        target: "casting_auth::signature",
                        alg = ?alg,
                        "Ignoring symmetric algorithm in allowlist"
                    );
                }
                asymmetric
            })
            .collect();
        Self { allowed_algorithms }
    }

    pub fn allowed_algorithms(&self) -> &[Algorithm] {
        &self.allowed_algorithms
    }

    /// Checks `raw`'s signature with the key its `kid` names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signature`] for any credential problem and [`Error::KeyFetch`] if the key set could not be
    /// fetched.
    pub async fn verify(&self, raw: RawToken, key_set: &KeySet) -> Result<VerifiedToken, Error> {
        let algorithm = self.accepted_algorithm(&raw)?;

        let kid = raw
            .key_id()
            .ok_or(SignatureError::UnknownKey { kid: None })?
            .to_string();
        let key = key_set
            .get_key(&kid)
            .await?
            .ok_or_else(|| SignatureError::UnknownKey {
                kid: Some(kid.clone()),
            })?;

        verify_with_key(&raw, &key, algorithm)?;

        Ok(VerifiedToken {
            payload: raw.into_payload(),
            key_id: kid,
            algorithm,
        })
    }

    fn accepted_algorithm(&self, raw: &RawToken) -> Result<Algorithm, SignatureError> {
        let declared = raw.algorithm();
        declared
            .and_then(|alg| Algorithm::from_str(alg).ok())
            .filter(|alg| self.allowed_algorithms.contains(alg))
            .ok_or_else(|| SignatureError::UnsupportedAlgorithm {
                alg: declared.map(str::to_string),
            })
    }
}

/// Verifies the signature of `raw` over its transmitted signed portion.
pub fn verify_with_key(
    raw: &RawToken,
    key: &SigningKey,
    algorithm: Algorithm,
) -> Result<(), SignatureError> {
    if !key.accepts(algorithm) {
        return Err(SignatureError::UnsupportedAlgorithm {
            alg: Some(format!("{algorithm:?}")),
        });
    }

    match jsonwebtoken::crypto::verify(
        raw.encoded_signature(),
        raw.signed_portion().as_bytes(),
        key.decoding_key(),
        algorithm,
    ) {
        Ok(true) => Ok(()),
        _ => Err(SignatureError::SignatureMismatch),
    }
}
