//! Payload serialization.
//!
//! Framing and dispatch treat payloads as opaque bytes. Typed helpers encode
//! with [`postcard`]; raw-byte registration remains available for payloads
//! produced by other schemas.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors produced while turning payload bytes into values or back.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Postcard serialization failed.
    #[error("encode error: {0}")]
    Encode(#[source] postcard::Error),

    /// Postcard deserialization failed.
    #[error("decode error: {0}")]
    Decode(#[source] postcard::Error),

    /// A hand-written decoder rejected the payload.
    #[error("invalid payload: {0}")]
    Invalid(String),
}

impl PayloadError {
    /// Convenience constructor for custom decoders.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

/// Serialize a value into payload bytes.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    postcard::to_allocvec(value).map_err(PayloadError::Encode)
}

/// Deserialize payload bytes into a value.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    postcard::from_bytes(bytes).map_err(PayloadError::Decode)
}
