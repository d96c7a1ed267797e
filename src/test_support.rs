//! Shared fixtures for unit tests: RSA signing keys, JWK sets and claim sets shaped like the identity provider's.

use std::sync::OnceLock;
use std::time::SystemTime;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use serde_json::{json, Value};

pub const ISSUER: &str = "https://fsndstack.eu.auth0.com/";
pub const AUDIENCE: &str = "agencyFSND";
pub const SUBJECT: &str = "auth0|60ce633dbd965400711ac9d3";

pub struct TestKey {
    kid: String,
    rsa: Rsa<Private>,
    encoding_key: EncodingKey,
}

impl TestKey {
    fn generate(kid: &str) -> Self {
        let rsa = Rsa::generate(2048).unwrap();
        let encoding_key = EncodingKey::from_rsa_der(&rsa.private_key_to_der().unwrap());
        TestKey {
            kid: kid.to_string(),
            rsa,
            encoding_key,
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn jwk(&self) -> Value {
        json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": self.kid,
            "n": URL_SAFE_NO_PAD.encode(self.rsa.n().to_vec()),
            "e": URL_SAFE_NO_PAD.encode(self.rsa.e().to_vec()),
        })
    }

    /// Signs `claims` with RS256, naming this key in the `kid` header.
    pub fn sign(&self, claims: &Value) -> String {
        self.sign_as(Algorithm::RS256, &self.kid, claims)
    }

    /// Signs `claims` with this key while declaring an arbitrary algorithm and key id.
    pub fn sign_as(&self, alg: Algorithm, kid: &str, claims: &Value) -> String {
        let mut header = Header::new(alg);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, claims, &self.encoding_key).unwrap()
    }
}

/// The identity provider's current signing key.
pub fn primary_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::generate("PMRDuf1vc0Wu5JvsEcbau"))
}

/// A key the identity provider rotates to.
pub fn rotated_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::generate("rotated-2026-10"))
}

/// A key unknown to the identity provider.
pub fn rogue_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::generate("rogue"))
}

pub fn jwks(keys: &[&TestKey]) -> Value {
    json!({ "keys": keys.iter().map(|key| key.jwk()).collect::<Vec<_>>() })
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Claims as issued for a casting-agency user holding `permissions`, valid for an hour from `now`.
pub fn claims(permissions: &[&str], now: u64) -> Value {
    json!({
        "iss": ISSUER,
        "sub": SUBJECT,
        "aud": AUDIENCE,
        "iat": now - 60,
        "exp": now + 3600,
        "azp": "Ts0nRFbcfR6y5Vqu25f3EBZQIryD5MaA",
        "scope": "",
        "permissions": permissions,
    })
}
