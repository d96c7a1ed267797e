use std::fmt;
use std::sync::Arc;

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::{header, HeaderValue, StatusCode};
use serde_json::json;

use crate::authorization::AuthStage;
use crate::claims::ClaimsError;
use crate::signature::SignatureError;
use crate::token::ParseError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("missing authorization header")]
    MissingAuthHeader,
    #[error("authorization header is not of the form `Bearer <token>`")]
    MalformedAuthHeader,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Claims(#[from] ClaimsError),
    #[error("token lacks the `{permission}` permission")]
    InsufficientPermission { permission: String, subject: String },
    #[error(transparent)]
    KeyFetch(#[from] KeyFetchError),
}

/// Failure to obtain the identity provider's key set.
///
/// Every variant is an infrastructure fault rather than a credential fault, see
/// [`ErrorKind::KeyFetchTransientFailure`].
/// `Clone`, so one failed refresh can be reported to every caller waiting on it.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone)]
pub enum KeyFetchError {
    #[error("failed to fetch JWK set")]
    Request(#[source] Arc<reqwest::Error>),
    #[error("failed to fetch OpenID configuration")]
    DiscoveryRequest(#[source] Arc<reqwest_middleware::Error>),
    #[error("received error response when fetching JWK set: {status_code}")]
    ErrorResponse { status_code: StatusCode },
    #[error("JWK set response is not a valid JWK set document")]
    InvalidDocument(#[source] Arc<reqwest::Error>),
    #[error("OpenID configuration response is not a valid configuration document")]
    InvalidConfiguration(#[source] Arc<reqwest::Error>),
    #[error("invalid URL in OpenID configuration")]
    InvalidUrl(#[from] url::ParseError),
    #[error("JWK set fetch pipeline is unavailable")]
    Unavailable,
    #[error("JWK set refresh task did not complete")]
    RefreshAborted,
}

impl From<reqwest::Error> for KeyFetchError {
    fn from(error: reqwest::Error) -> Self {
        KeyFetchError::Request(Arc::new(error))
    }
}

impl From<reqwest_middleware::Error> for KeyFetchError {
    fn from(error: reqwest_middleware::Error) -> Self {
        KeyFetchError::DiscoveryRequest(Arc::new(error))
    }
}

impl KeyFetchError {
    pub(crate) fn invalid_document(error: reqwest::Error) -> Self {
        KeyFetchError::InvalidDocument(Arc::new(error))
    }

    pub(crate) fn invalid_configuration(error: reqwest::Error) -> Self {
        KeyFetchError::InvalidConfiguration(Arc::new(error))
    }
}

/// Stable, machine-readable name of an [`Error`].
///
/// The string form is part of the HTTP contract: clients branch on the `error_kind` field of rejection bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingAuthHeader,
    MalformedAuthHeader,
    MalformedStructure,
    InvalidEncoding,
    InvalidJson,
    UnsupportedAlgorithm,
    UnknownKey,
    SignatureMismatch,
    IssuerMismatch,
    AudienceMismatch,
    Expired,
    NotYetValid,
    MissingRequiredClaim,
    InsufficientPermission,
    KeyFetchTransientFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingAuthHeader => "MissingAuthHeader",
            ErrorKind::MalformedAuthHeader => "MalformedAuthHeader",
            ErrorKind::MalformedStructure => "MalformedStructure",
            ErrorKind::InvalidEncoding => "InvalidEncoding",
            ErrorKind::InvalidJson => "InvalidJSON",
            ErrorKind::UnsupportedAlgorithm => "UnsupportedAlgorithm",
            ErrorKind::UnknownKey => "UnknownKey",
            ErrorKind::SignatureMismatch => "SignatureMismatch",
            ErrorKind::IssuerMismatch => "IssuerMismatch",
            ErrorKind::AudienceMismatch => "AudienceMismatch",
            ErrorKind::Expired => "Expired",
            ErrorKind::NotYetValid => "NotYetValid",
            ErrorKind::MissingRequiredClaim => "MissingRequiredClaim",
            ErrorKind::InsufficientPermission => "InsufficientPermission",
            ErrorKind::KeyFetchTransientFailure => "KeyFetchTransientFailure",
        }
    }

    /// Whether retrying the whole request later may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::KeyFetchTransientFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingAuthHeader => ErrorKind::MissingAuthHeader,
            Error::MalformedAuthHeader => ErrorKind::MalformedAuthHeader,
            Error::Parse(ParseError::MalformedStructure) => ErrorKind::MalformedStructure,
            Error::Parse(ParseError::InvalidEncoding { .. }) => ErrorKind::InvalidEncoding,
            Error::Parse(ParseError::InvalidJson { .. }) => ErrorKind::InvalidJson,
            Error::Signature(SignatureError::UnsupportedAlgorithm { .. }) => {
                ErrorKind::UnsupportedAlgorithm
            }
            Error::Signature(SignatureError::UnknownKey { .. }) => ErrorKind::UnknownKey,
            Error::Signature(SignatureError::SignatureMismatch) => ErrorKind::SignatureMismatch,
            Error::Claims(ClaimsError::IssuerMismatch) => ErrorKind::IssuerMismatch,
            Error::Claims(ClaimsError::AudienceMismatch) => ErrorKind::AudienceMismatch,
            Error::Claims(ClaimsError::Expired) => ErrorKind::Expired,
            Error::Claims(ClaimsError::NotYetValid) => ErrorKind::NotYetValid,
            Error::Claims(ClaimsError::MissingRequiredClaim(_)) => ErrorKind::MissingRequiredClaim,
            Error::InsufficientPermission { .. } => ErrorKind::InsufficientPermission,
            Error::KeyFetch(_) => ErrorKind::KeyFetchTransientFailure,
        }
    }

    /// The middleware state in which a request failing with this error was rejected.
    pub fn stage(&self) -> AuthStage {
        match self {
            Error::MissingAuthHeader | Error::MalformedAuthHeader => AuthStage::Unauthenticated,
            Error::Parse(_) | Error::Signature(_) | Error::KeyFetch(_) => AuthStage::TokenExtracted,
            Error::Claims(_) => AuthStage::SignatureVerified,
            Error::InsufficientPermission { .. } => AuthStage::ClaimsValidated,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::KeyFetchTransientFailure => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let body = Json(json!({
            "success": false,
            "error": status_code.as_u16(),
            "error_kind": self.kind().as_str(),
            "message": self.to_string(),
        }));
        let mut response = (status_code, body).into_response();
        if status_code == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
