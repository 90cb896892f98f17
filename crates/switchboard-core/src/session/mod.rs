//! Short-lived session state owned by the gateway.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::envelope::{AgentKind, RequestType};
use crate::types::{RequestId, SessionId};

pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Sessions expire this long after their last write.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl SessionStoreError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }
}

/// Which request an agent was last handed for this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub request_id: RequestId,
    pub request_type: RequestType,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRequest {
    pub request_id: RequestId,
    #[serde(rename = "type")]
    pub agent: AgentKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub customer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub active: bool,
    #[serde(default)]
    pub agent_assignments: BTreeMap<AgentKind, AgentAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<LastRequest>,
}

impl SessionRecord {
    pub fn new(customer_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            session_id: SessionId::new(),
            customer_id: customer_id.into(),
            user_id,
            start_time: Utc::now(),
            active: true,
            agent_assignments: BTreeMap::new(),
            last_request: None,
        }
    }

    /// Records that `request_id` was routed to `agent`.
    pub fn record_submission(
        &mut self,
        agent: AgentKind,
        request_id: &RequestId,
        request_type: &RequestType,
    ) {
        let now = Utc::now();
        self.agent_assignments.insert(
            agent,
            AgentAssignment {
                request_id: request_id.clone(),
                request_type: request_type.clone(),
                assigned_at: now,
            },
        );
        self.last_request = Some(LastRequest {
            request_id: request_id.clone(),
            agent,
            timestamp: now,
        });
    }
}

/// TTL-bounded key-value store of [`SessionRecord`]s.
///
/// Every `put` restarts the record's TTL. Expired records behave exactly like
/// missing ones.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, SessionStoreError>;

    async fn put(&self, record: &SessionRecord) -> Result<(), SessionStoreError>;

    /// Applies `apply` to the record only while it is live and active, as one
    /// atomic step, and refreshes its TTL. Returns the updated record, or
    /// `None` when the session is missing, expired or closed.
    async fn update_active(
        &self,
        session_id: &SessionId,
        apply: &(dyn for<'r> Fn(&'r mut SessionRecord) + Send + Sync),
    ) -> Result<Option<SessionRecord>, SessionStoreError>;

    /// Returns whether a live record was removed.
    async fn remove(&self, session_id: &SessionId) -> Result<bool, SessionStoreError>;

    fn ttl(&self) -> Duration;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_updates_assignment_and_last_request() {
        let mut record = SessionRecord::new("cust-1", Some("agent-smith".to_string()));
        let request_id = RequestId::from_string("r-1");
        record.record_submission(AgentKind::Billing, &request_id, &RequestType::RefundRequest);

        let assignment = &record.agent_assignments[&AgentKind::Billing];
        assert_eq!(assignment.request_id, request_id);
        let last = record.last_request.as_ref().unwrap();
        assert_eq!(last.agent, AgentKind::Billing);
        assert_eq!(last.request_id, request_id);
    }

    #[test]
    fn record_json_uses_agent_names_as_keys() {
        let mut record = SessionRecord::new("cust-1", None);
        record.record_submission(
            AgentKind::International,
            &RequestId::from_string("r-2"),
            &RequestType::RateInquiry,
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value["agent_assignments"]["international"]["request_type"],
            "rate_inquiry"
        );
        assert_eq!(value["last_request"]["type"], "international");
        assert!(value.get("user_id").is_none());

        let back: SessionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
