//! Untrusted decoding of compact signed tokens.
//!
//! Nothing produced here has been verified. A [`RawToken`] only guarantees that the token is structurally a compact
//! JWS: three base64url segments, the first two of which are JSON objects.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};

/// Upper bound on the length of an accepted token, checked before any decoding.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8 * 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("token is not made of three dot-separated segments")]
    MalformedStructure,
    #[error("token {segment} segment is not valid base64url")]
    InvalidEncoding { segment: Segment },
    #[error("token {segment} segment is not a JSON object")]
    InvalidJson { segment: Segment },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Header,
    Payload,
    Signature,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Segment::Header => "header",
            Segment::Payload => "payload",
            Segment::Signature => "signature",
        })
    }
}

/// The decoded segments of a compact token together with the exact bytes its signature covers.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToken {
    header: Map<String, Value>,
    payload: Map<String, Value>,
    signature: Vec<u8>,
    encoded_signature: String,
    signed_portion: String,
}

impl RawToken {
    pub fn parse(token: &str) -> Result<Self, ParseError> {
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            return Err(ParseError::MalformedStructure);
        }

        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(ParseError::MalformedStructure);
        };

        // Taken from the transmitted string, the signature is computed over these bytes and not over a re-encoding.
        let signed_portion = token
            .get(..header.len() + 1 + payload.len())
            .ok_or(ParseError::MalformedStructure)?
            .to_string();

        Ok(Self {
            header: decode_object(header, Segment::Header)?,
            payload: decode_object(payload, Segment::Payload)?,
            signature: decode_segment(signature, Segment::Signature)?,
            encoded_signature: signature.to_string(),
            signed_portion,
        })
    }

    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The signature segment exactly as transmitted.
    pub fn encoded_signature(&self) -> &str {
        &self.encoded_signature
    }

    /// `header '.' payload` exactly as transmitted.
    pub fn signed_portion(&self) -> &str {
        &self.signed_portion
    }

    /// The `alg` header parameter, if it is a string.
    pub fn algorithm(&self) -> Option<&str> {
        self.header.get("alg").and_then(Value::as_str)
    }

    /// The `kid` header parameter, if it is a string.
    pub fn key_id(&self) -> Option<&str> {
        self.header.get("kid").and_then(Value::as_str)
    }

    pub(crate) fn into_payload(self) -> Map<String, Value> {
        self.payload
    }
}

/// Splits and decodes `token` without trusting any of its contents.
pub fn parse(token: &str) -> Result<RawToken, ParseError> {
    RawToken::parse(token)
}

fn decode_segment(segment: &str, which: Segment) -> Result<Vec<u8>, ParseError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| ParseError::InvalidEncoding { segment: which })
}

fn decode_object(segment: &str, which: Segment) -> Result<Map<String, Value>, ParseError> {
    let bytes = decode_segment(segment, which)?;
    serde_json::from_slice(&bytes).map_err(|_| ParseError::InvalidJson { segment: which })
}
