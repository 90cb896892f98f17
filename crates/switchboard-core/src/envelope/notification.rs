use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const UNKNOWN_REQUEST_TYPE: &str = "Unknown request type";
pub const PROCESSING_ERROR: &str = "Processing error";
pub const INVALID_ENVELOPE: &str = "Invalid envelope";
pub const MALFORMED_ENVELOPE: &str = "Malformed envelope";

/// Event published on the supervisor channel. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorNotification {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// The original request, or the error context when no request could be
    /// recovered.
    pub request: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub escalation: Option<String>,
}

impl SupervisorNotification {
    pub fn error(source: impl Into<String>, request: Value, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            request,
            error: Some(error.into()),
            escalation: None,
        }
    }

    pub fn escalation(
        source: impl Into<String>,
        request: Value,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            request,
            error: None,
            escalation: Some(reason.into()),
        }
    }

    pub fn unknown_type(source: impl Into<String>, request: Value) -> Self {
        Self::error(source, request, UNKNOWN_REQUEST_TYPE)
    }

    /// Handler failure. Keeps the raw body so the request can be replayed.
    pub fn processing_error(source: impl Into<String>, error: &str, raw_body: &[u8]) -> Self {
        let context = json!({
            "error": error,
            "body": String::from_utf8_lossy(raw_body),
        });
        Self::error(source, context, PROCESSING_ERROR)
    }

    pub fn undeliverable(
        source: impl Into<String>,
        kind: &str,
        reason: &str,
        raw_body: &[u8],
    ) -> Self {
        let context = json!({
            "error": reason,
            "body": String::from_utf8_lossy(raw_body),
        });
        Self::error(source, context, kind)
    }

    pub fn is_escalation(&self) -> bool {
        self.escalation.is_some()
    }
}
