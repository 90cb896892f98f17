use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Pending,
}

/// An agent's answer to one request.
///
/// `payload` holds the type-specific fields and is flattened next to
/// `status` and `request_id` on the wire. Correlation metadata travels in the
/// transport properties, not in the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: ResponseStatus,
    pub request_id: RequestId,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn new(request_id: RequestId, status: ResponseStatus) -> Self {
        Self {
            status,
            request_id,
            payload: Map::new(),
        }
    }

    pub fn success(request_id: RequestId) -> Self {
        Self::new(request_id, ResponseStatus::Success)
    }

    pub fn pending(request_id: RequestId) -> Self {
        Self::new(request_id, ResponseStatus::Pending)
    }

    pub fn error(request_id: RequestId, message: impl Into<String>) -> Self {
        Self::new(request_id, ResponseStatus::Error).with("message", message.into())
    }

    /// Adds a payload field. `status` and `request_id` are reserved and
    /// silently ignored here so the flattened body stays unambiguous.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        if key != "status" && key != "request_id" {
            self.payload.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_flattened_on_the_wire() {
        let response = ResponseEnvelope::success(RequestId::from_string("r-1"))
            .with("action", "refund_approved")
            .with("amount", 25.0);

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "success",
                "request_id": "r-1",
                "action": "refund_approved",
                "amount": 25.0
            })
        );
    }

    #[test]
    fn reserved_keys_are_not_shadowed() {
        let response = ResponseEnvelope::pending(RequestId::from_string("r-2"))
            .with("status", "success")
            .with("request_id", "other");
        assert!(response.payload.is_empty());
        assert_eq!(response.status, ResponseStatus::Pending);
    }

    #[test]
    fn error_response_carries_message() {
        let response = ResponseEnvelope::error(RequestId::from_string("r-3"), "boom");
        assert_eq!(response.message(), Some("boom"));
        assert_eq!(response.status.to_string(), "error");
    }
}
