//! Validation of a verified token's registered claims.
//!
//! All checks take the current time as an argument and never read the clock themselves.

use std::collections::HashSet;
use std::fmt;

use serde_json::{Map, Value};

use crate::signature::VerifiedToken;

/// Claim holding the caller's permissions unless configured otherwise.
pub const DEFAULT_PERMISSIONS_CLAIM: &str = "permissions";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("token issuer is not accepted")]
    IssuerMismatch,
    #[error("token audience is not accepted")]
    AudienceMismatch,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("token is missing required claim `{0}`")]
    MissingRequiredClaim(String),
}

/// What a token's claims must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimsRules {
    issuer: String,
    audience: String,
    leeway: u64,
    permissions_claim: String,
}

impl ClaimsRules {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway: 0,
            permissions_claim: DEFAULT_PERMISSIONS_CLAIM.to_string(),
        }
    }

    /// Tolerated clock skew, in seconds, applied to `exp`, `iat` and `nbf`.
    pub fn with_leeway(mut self, leeway: u64) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn with_permissions_claim(mut self, permissions_claim: impl Into<String>) -> Self {
        self.permissions_claim = permissions_claim.into();
        self
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn leeway(&self) -> u64 {
        self.leeway
    }

    pub fn permissions_claim(&self) -> &str {
        &self.permissions_claim
    }
}

/// The validated claims of a single request's token.
///
/// Only produced by [`validate`], so holding a `Claims` implies the signature was verified and every check passed.
/// The subject is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Claims {
    issuer: String,
    audience: Vec<String>,
    subject: String,
    expires_at: u64,
    issued_at: Option<u64>,
    not_before: Option<u64>,
    permissions: HashSet<String>,
}

impl Claims {
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &[String] {
        &self.audience
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn issued_at(&self) -> Option<u64> {
        self.issued_at
    }

    pub fn not_before(&self) -> Option<u64> {
        self.not_before
    }

    pub fn permissions(&self) -> &HashSet<String> {
        &self.permissions
    }

    /// Exact, case-sensitive membership test.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

impl fmt::Debug for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claims")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("subject", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("issued_at", &self.issued_at)
            .field("not_before", &self.not_before)
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// Validates `token`'s claims against `rules` at time `now` (seconds since the Unix epoch).
///
/// Checks run in order and the first failure wins: issuer, audience, expiry, issued-at, not-before, subject,
/// permissions.
pub fn validate(token: &VerifiedToken, rules: &ClaimsRules, now: u64) -> Result<Claims, ClaimsError> {
    validate_payload(token.payload(), rules, now)
}

fn validate_payload(
    payload: &Map<String, Value>,
    rules: &ClaimsRules,
    now: u64,
) -> Result<Claims, ClaimsError> {
    let issuer = required(payload, "iss", Value::as_str)?;
    if issuer != rules.issuer {
        return Err(ClaimsError::IssuerMismatch);
    }

    let audience = required(payload, "aud", read_audience)?;
    if !audience.iter().any(|aud| *aud == rules.audience) {
        return Err(ClaimsError::AudienceMismatch);
    }

    let expires_at = required(payload, "exp", numeric_date)?;
    if now >= expires_at.saturating_add(rules.leeway) {
        return Err(ClaimsError::Expired);
    }

    let not_after_now = |timestamp: Option<u64>| match timestamp {
        Some(timestamp) if timestamp > now.saturating_add(rules.leeway) => {
            Err(ClaimsError::NotYetValid)
        }
        _ => Ok(timestamp),
    };
    let issued_at = not_after_now(optional(payload, "iat", numeric_date)?)?;
    let not_before = not_after_now(optional(payload, "nbf", numeric_date)?)?;

    let subject = required(payload, "sub", Value::as_str)?;

    let permissions = optional(payload, &rules.permissions_claim, read_permissions)?.unwrap_or_default();

    Ok(Claims {
        issuer: issuer.to_string(),
        audience,
        subject: subject.to_string(),
        expires_at,
        issued_at,
        not_before,
        permissions,
    })
}

/// Reads claim `name`. Absent or `null` is `Ok(None)`, a value `read` rejects is reported as missing.
fn optional<'a, T>(
    payload: &'a Map<String, Value>,
    name: &str,
    read: impl FnOnce(&'a Value) -> Option<T>,
) -> Result<Option<T>, ClaimsError> {
    match payload.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => read(value)
            .map(Some)
            .ok_or_else(|| ClaimsError::MissingRequiredClaim(name.to_string())),
    }
}

fn required<'a, T>(
    payload: &'a Map<String, Value>,
    name: &str,
    read: impl FnOnce(&'a Value) -> Option<T>,
) -> Result<T, ClaimsError> {
    optional(payload, name, read)?.ok_or_else(|| ClaimsError::MissingRequiredClaim(name.to_string()))
}

/// Seconds since the epoch; fractional dates are floored.
fn numeric_date(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| secs.floor() as u64)
    })
}

fn read_audience(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(aud) => Some(vec![aud.clone()]),
        Value::Array(auds) => auds
            .iter()
            .map(|aud| aud.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

fn read_permissions(value: &Value) -> Option<HashSet<String>> {
    value
        .as_array()?
        .iter()
        .map(|permission| permission.as_str().map(str::to_string))
        .collect()
}
