//! Transport encoding for requests crossing a process or host boundary.
//!
//! A payload is wrapped in a versioned envelope, written as JSON and then
//! base64 encoded with the URL safe alphabet (no padding). The result only
//! contains `[A-Za-z0-9_-]` and always starts with a letter, so it can be
//! embedded in a shell command line as a single argument without quoting.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use thiserror::Error;
use tracing::{debug, error};

/// Tag written into every envelope, bumped on incompatible payload changes
pub const FORMAT_TAG: &str = "tomobatch/1";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed encoding: {0}")]
    MalformedEncoding(String),
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),
    #[error("Unsupported format `{0}`, expected `{FORMAT_TAG}`")]
    UnsupportedVersion(String),
}

/// Opaque, shell safe string produced by `encode`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EncodedRequest(String);

impl EncodedRequest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EncodedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EncodedRequest {
    type Err = CodecError;

    /// accept untrusted input, surrounding whitespace (e.g. a trailing newline) is dropped
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();

        if trimmed.is_empty() {
            Err(CodecError::MalformedEncoding(String::from("empty input")))
        } else if let Some(invalid) = trimmed.chars().find(|c| !is_alphabet(*c)) {
            Err(CodecError::MalformedEncoding(format!(
                "character {invalid:?} is outside the encoding alphabet"
            )))
        } else {
            Ok(Self(trimmed.to_owned()))
        }
    }
}

fn is_alphabet(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// true if `input` can be passed as one shell argument without quoting or escaping
pub fn is_transport_safe(input: &str) -> bool {
    !input.is_empty() && !input.starts_with('-') && input.chars().all(is_alphabet)
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    format: &'a str,
    request: &'a T,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    format: String,
    request: Value,
}

/// Encode any payload whose structure survives a trip through the format.
///
/// The payload is decoded again before returning, so values JSON cannot carry
/// (e.g. a NaN silently turning into `null`) are refused here instead of
/// surfacing on the receiving host.
pub fn encode<T>(payload: &T) -> Result<EncodedRequest, CodecError>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    let json = serde_json::to_vec(&EnvelopeRef {
        format: FORMAT_TAG,
        request: payload,
    })
    .map_err(|error| CodecError::UnsupportedType(error.to_string()))?;

    let encoded = EncodedRequest(URL_SAFE_NO_PAD.encode(json));

    match decode::<T>(&encoded) {
        Ok(decoded) if decoded == *payload => {
            debug!(length = encoded.0.len(), "Encoded request");

            Ok(encoded)
        }
        Ok(_) => Err(CodecError::UnsupportedType(String::from(
            "payload contains values that do not survive encoding (non-finite number?)",
        ))),
        Err(error) => Err(CodecError::UnsupportedType(error.to_string())),
    }
}

/// Decode and validate the envelope, then deserialize the payload
pub fn decode<T: DeserializeOwned>(encoded: &EncodedRequest) -> Result<T, CodecError> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.as_str()).map_err(|error| {
        error!(error = ?error, "Failed to decode base64 layer");

        CodecError::MalformedEncoding(error.to_string())
    })?;

    // anything that fails here was never a complete envelope, e.g. truncated in transit
    let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|error| {
        error!(error = ?error, "Failed to parse envelope");

        CodecError::MalformedEncoding(error.to_string())
    })?;

    if envelope.format != FORMAT_TAG {
        return Err(CodecError::UnsupportedVersion(envelope.format));
    }

    serde_json::from_value(envelope.request).map_err(|error| {
        error!(error = ?error, "Envelope payload does not match the request schema");

        CodecError::UnsupportedType(error.to_string())
    })
}

/// Convenience for untrusted strings, e.g. a command line argument
pub fn decode_str<T: DeserializeOwned>(input: &str) -> Result<T, CodecError> {
    decode(&input.parse()?)
}
