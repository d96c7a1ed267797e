use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};

use crate::error::KeyFetchError;
use crate::remote_key_set::RemoteKeySet;

/// A single JSON Web Key as published by the identity provider.
///
/// Only the members needed to build a verification key are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// The `{"keys": [...]}` document served at the provider's JWKS endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSetDocument {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ec,
    Okp,
}

impl KeyType {
    /// The key type able to verify `alg`, or `None` for symmetric algorithms.
    pub fn for_algorithm(alg: Algorithm) -> Option<Self> {
        match alg {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Some(KeyType::Rsa),
            Algorithm::ES256 | Algorithm::ES384 => Some(KeyType::Ec),
            Algorithm::EdDSA => Some(KeyType::Okp),
            _ => None,
        }
    }
}

/// Whether `alg` is verified with a public key.
pub fn is_asymmetric(alg: Algorithm) -> bool {
    KeyType::for_algorithm(alg).is_some()
}

#[derive(thiserror::Error, Debug)]
pub enum InvalidJwk {
    #[error("key has no `kid`")]
    MissingKid,
    #[error("key is not meant for signatures (use = `{0}`)")]
    NotASigningKey(String),
    #[error("unsupported key type `{0}`")]
    UnsupportedKeyType(String),
    #[error("unsupported key algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error("key is missing the `{0}` parameter")]
    MissingParameter(&'static str),
    #[error("failed to decode JWK into key")]
    InvalidKeyMaterial(#[source] jsonwebtoken::errors::Error),
}

/// A verification key resolved from a [`Jwk`]. Immutable once built.
#[derive(Clone)]
pub struct SigningKey {
    key_id: String,
    key_type: KeyType,
    algorithm: Option<Algorithm>,
    decoding_key: DecodingKey,
}

impl SigningKey {
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, InvalidJwk> {
        let key_id = jwk.kid.clone().ok_or(InvalidJwk::MissingKid)?;

        if let Some(key_use) = jwk.key_use.as_deref().filter(|key_use| *key_use != "sig") {
            return Err(InvalidJwk::NotASigningKey(key_use.to_string()));
        }

        let algorithm = jwk
            .alg
            .as_deref()
            .map(|alg| match Algorithm::from_str(alg) {
                Ok(alg) if is_asymmetric(alg) => Ok(alg),
                _ => Err(InvalidJwk::UnsupportedAlgorithm(alg.to_string())),
            })
            .transpose()?;

        let (key_type, decoding_key) = match jwk.kty.as_str() {
            "RSA" => (
                KeyType::Rsa,
                DecodingKey::from_rsa_components(param(&jwk.n, "n")?, param(&jwk.e, "e")?),
            ),
            "EC" => (
                KeyType::Ec,
                DecodingKey::from_ec_components(param(&jwk.x, "x")?, param(&jwk.y, "y")?),
            ),
            "OKP" if jwk.crv.as_deref() == Some("Ed25519") => {
                (KeyType::Okp, DecodingKey::from_ed_components(param(&jwk.x, "x")?))
            }
            other => return Err(InvalidJwk::UnsupportedKeyType(other.to_string())),
        };
        let decoding_key = decoding_key.map_err(InvalidJwk::InvalidKeyMaterial)?;

        if let Some(alg) = algorithm {
            if KeyType::for_algorithm(alg) != Some(key_type) {
                return Err(InvalidJwk::UnsupportedAlgorithm(format!("{alg:?}")));
            }
        }

        Ok(Self {
            key_id,
            key_type,
            algorithm,
            decoding_key,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// The algorithm the key is pinned to, if the provider declared one.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Whether this key may verify a signature made with `alg`.
    pub fn accepts(&self, alg: Algorithm) -> bool {
        KeyType::for_algorithm(alg) == Some(self.key_type)
            && self.algorithm.map_or(true, |pinned| pinned == alg)
    }
}

fn param<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, InvalidJwk> {
    value.as_deref().ok_or(InvalidJwk::MissingParameter(name))
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("key_type", &self.key_type)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// An immutable `kid -> key` map.
#[derive(Debug, Clone, Default)]
pub struct StaticKeySet {
    keys: Arc<HashMap<String, SigningKey>>,
}

impl StaticKeySet {
    /// Builds the key map, skipping keys that cannot be used for verification.
    pub fn from_document(document: JwkSetDocument) -> Self {
        let keys = document
            .keys
            .iter()
            .filter_map(|jwk| match SigningKey::from_jwk(jwk) {
                Ok(key) => Some((key.key_id.clone(), key)),
                Err(error) => {
                    tracing::warn!(
                        target: "casting_auth::key_set",
                        kid = ?jwk.kid,
                        error = %error,
                        "Skipping unusable JWK"
                    );
                    None
                }
            })
            .collect();
        Self {
            keys: Arc::new(keys),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json).map(Self::from_document)
    }

    pub fn get(&self, kid: &str) -> Option<&SigningKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

/// Source of signing keys: either fixed at construction or fetched from the identity provider.
#[derive(Debug, Clone)]
pub enum KeySet {
    Local(StaticKeySet),
    Remote(RemoteKeySet),
}

impl KeySet {
    /// Resolves `kid`. `Ok(None)` means the signer is unknown, even after a refresh of a remote set.
    pub async fn get_key(&self, kid: &str) -> Result<Option<SigningKey>, KeyFetchError> {
        match self {
            KeySet::Local(local_key_set) => Ok(local_key_set.get(kid).cloned()),
            KeySet::Remote(remote_key_set) => remote_key_set.get_key(kid).await,
        }
    }
}

impl From<StaticKeySet> for KeySet {
    fn from(key_set: StaticKeySet) -> Self {
        KeySet::Local(key_set)
    }
}

impl From<RemoteKeySet> for KeySet {
    fn from(remote_key_set: RemoteKeySet) -> Self {
        KeySet::Remote(remote_key_set)
    }
}

#[cfg(test)]
mod test {
    use jsonwebtoken::Algorithm;
    use serde_json::json;

    use super::{InvalidJwk, Jwk, JwkSetDocument, KeySet, KeyType, SigningKey, StaticKeySet};
    use crate::test_support::{jwks, primary_key, rotated_key};

    fn jwk(value: serde_json::Value) -> Jwk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rsa_jwk_becomes_signing_key() {
        let key = SigningKey::from_jwk(&jwk(primary_key().jwk())).unwrap();

        assert_eq!(key.key_id(), primary_key().kid());
        assert_eq!(key.key_type(), KeyType::Rsa);
        assert_eq!(key.algorithm(), Some(Algorithm::RS256));
        assert!(key.accepts(Algorithm::RS256));
        assert!(!key.accepts(Algorithm::RS512));
        assert!(!key.accepts(Algorithm::HS256));
        assert!(!key.accepts(Algorithm::ES256));
    }

    #[test]
    fn test_key_without_declared_algorithm_accepts_its_family() {
        let mut value = primary_key().jwk();
        value.as_object_mut().unwrap().remove("alg");
        let key = SigningKey::from_jwk(&jwk(value)).unwrap();

        assert_eq!(key.algorithm(), None);
        assert!(key.accepts(Algorithm::RS384));
        assert!(key.accepts(Algorithm::PS256));
        assert!(!key.accepts(Algorithm::EdDSA));
        assert!(!key.accepts(Algorithm::HS512));
    }

    #[test]
    fn test_unusable_jwks_are_rejected() {
        let cases = [
            json!({ "kty": "RSA", "n": "AQAB", "e": "AQAB" }),
            json!({ "kty": "RSA", "kid": "enc", "use": "enc", "n": "AQAB", "e": "AQAB" }),
            json!({ "kty": "oct", "kid": "hmac", "k": "c2VjcmV0" }),
            json!({ "kty": "RSA", "kid": "hs", "alg": "HS256", "n": "AQAB", "e": "AQAB" }),
            json!({ "kty": "RSA", "kid": "no-e", "n": "AQAB" }),
            json!({ "kty": "RSA", "kid": "mixed", "alg": "ES256", "n": "AQAB", "e": "AQAB" }),
        ];
        for case in cases {
            assert!(SigningKey::from_jwk(&jwk(case.clone())).is_err(), "{case}");
        }

        assert!(matches!(
            SigningKey::from_jwk(&jwk(json!({ "kty": "oct", "kid": "hmac" }))),
            Err(InvalidJwk::UnsupportedKeyType(kty)) if kty == "oct"
        ));
    }

    #[test]
    fn test_static_key_set_skips_unusable_keys() {
        let mut document: JwkSetDocument =
            serde_json::from_value(jwks(&[primary_key(), rotated_key()])).unwrap();
        document.keys.push(jwk(json!({ "kty": "oct", "kid": "hmac", "k": "c2VjcmV0" })));

        let key_set = StaticKeySet::from_document(document);

        assert_eq!(key_set.len(), 2);
        assert!(key_set.get(primary_key().kid()).is_some());
        assert!(key_set.get(rotated_key().kid()).is_some());
        assert!(key_set.get("hmac").is_none());

        let mut key_ids: Vec<&str> = key_set.key_ids().collect();
        key_ids.sort_unstable();
        let mut expected = vec![primary_key().kid(), rotated_key().kid()];
        expected.sort_unstable();
        assert_eq!(key_ids, expected);
    }

    #[tokio::test]
    async fn test_local_key_set_lookup() {
        let key_set: KeySet = StaticKeySet::from_json(&jwks(&[primary_key()]).to_string())
            .unwrap()
            .into();

        let found = key_set.get_key(primary_key().kid()).await.unwrap();
        assert_eq!(found.unwrap().key_id(), primary_key().kid());
        assert!(key_set.get_key("unknown").await.unwrap().is_none());
    }
}
