use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::notification::SupervisorNotification;
use super::request::{RequestEnvelope, RequestType, WireRequest};
use super::response::ResponseEnvelope;
use crate::types::{RequestId, SessionId};

/// Failure to turn bytes into an envelope, or an envelope into bytes.
///
/// `Malformed` means the bytes are not JSON at all (a transport-level
/// problem); `Invalid` means the JSON parsed but does not describe a routable
/// envelope. Both are poison: neither gets better on redelivery.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Invalid envelope: {reason}")]
    Invalid { reason: String },

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Byte-level codec shared by every message on the channel.
pub trait Envelope: Sized {
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

fn parse_object(bytes: &[u8]) -> Result<Value, CodecError> {
    let value: Value = serde_json::from_slice(bytes).map_err(CodecError::Malformed)?;
    if !value.is_object() {
        return Err(CodecError::invalid("expected a JSON object"));
    }
    Ok(value)
}

fn required(field: Option<String>, name: &str) -> Result<String, CodecError> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(CodecError::invalid(format!("missing required field `{name}`"))),
    }
}

impl Envelope for RequestEnvelope {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&WireRequest::from_envelope(self)).map_err(CodecError::Encode)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value = parse_object(bytes)?;
        let wire: WireRequest =
            serde_json::from_value(value).map_err(|e| CodecError::invalid(e.to_string()))?;

        let request_id = required(wire.request_id, "request_id")?;
        let request_type = required(wire.request_type, "type")?;
        let session_id = required(wire.session_id, "session_id")?;
        let customer_id = required(wire.customer_id, "customer_id")?;
        let timestamp = required(wire.timestamp, "timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| CodecError::invalid(format!("invalid timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(RequestEnvelope::from_parts(
            RequestId::from_string(request_id),
            SessionId::from_string(session_id),
            customer_id,
            RequestType::parse(&request_type),
            wire.details,
            timestamp,
        ))
    }
}

impl Envelope for ResponseEnvelope {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value = parse_object(bytes)?;
        let response: ResponseEnvelope =
            serde_json::from_value(value).map_err(|e| CodecError::invalid(e.to_string()))?;
        if response.request_id.as_str().trim().is_empty() {
            return Err(CodecError::invalid("missing required field `request_id`"));
        }
        Ok(response)
    }
}

impl Envelope for SupervisorNotification {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value = parse_object(bytes)?;
        serde_json::from_value(value).map_err(|e| CodecError::invalid(e.to_string()))
    }
}
