//! Payload encoding for liveness flags, outbox entries and consumer decoding
//!
//! The session never serializes directly; it goes through a [`PayloadCodec`]
//! so deployments can swap the wire format without touching the core.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Encoding collaborator used by the agent session
pub trait PayloadCodec: Send + Sync {
    /// Short format name used in logs and errors
    fn format(&self) -> &'static str;

    /// Encode a structured value into payload bytes
    fn encode(&self, value: &Value) -> Result<Bytes, EncodingError>;

    /// Decode payload bytes into a structured value
    fn decode(&self, payload: &[u8]) -> Result<Value, EncodingError>;
}

/// Encode any serializable value with the given codec
pub fn encode_with<T>(codec: &dyn PayloadCodec, value: &T) -> Result<Bytes, EncodingError>
where
    T: Serialize + ?Sized,
{
    let structured = serde_json::to_value(value).map_err(EncodingError::Conversion)?;
    codec.encode(&structured)
}

/// Decode payload bytes into `T` with the given codec
pub fn decode_with<T>(codec: &dyn PayloadCodec, payload: &[u8]) -> Result<T, EncodingError>
where
    T: DeserializeOwned,
{
    let structured = codec.decode(payload)?;
    serde_json::from_value(structured).map_err(EncodingError::Decode)
}

/// JSON payload codec (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, EncodingError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| EncodingError::Rejected {
                format: self.format(),
                message: e.to_string(),
            })
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, EncodingError> {
        serde_json::from_slice(payload).map_err(EncodingError::Decode)
    }
}

/// Payload encoding errors
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("value cannot be represented as a payload: {0}")]
    Conversion(#[source] serde_json::Error),
    #[error("{format} codec rejected payload: {message}")]
    Rejected {
        format: &'static str,
        message: String,
    },
    #[error("payload could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}
