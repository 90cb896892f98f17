//! Messages exchanged between the gateway, the agents and the supervisor.

mod codec;
mod notification;
mod request;
mod response;

use serde::{Deserialize, Serialize};

pub use codec::{CodecError, Envelope};
pub use notification::{
    INVALID_ENVELOPE, MALFORMED_ENVELOPE, PROCESSING_ERROR, SupervisorNotification,
    UNKNOWN_REQUEST_TYPE,
};
pub use request::{
    BillingInquiry, PackageActivation, PlanChange, RateInquiry, RefundRequest, RequestDetails,
    RequestEnvelope, RequestType, RoamingActivation, UsageDiscrepancy,
};
pub use response::{ResponseEnvelope, ResponseStatus};

/// Shared queue every agent reports failures and escalations to.
pub const SUPERVISOR_QUEUE: &str = "supervisor_notifications";

/// Agent categories. Each one owns a `<agent>_requests` inbound queue and a
/// `<agent>_responses` outbound queue.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentKind {
    Billing,
    International,
}

impl AgentKind {
    pub fn requests_queue(self) -> String {
        format!("{self}_requests")
    }

    pub fn responses_queue(self) -> String {
        format!("{self}_responses")
    }

    /// Name used as `source` on supervisor notifications.
    pub fn source_name(self) -> String {
        format!("{self}_agent")
    }

    pub fn all() -> impl Iterator<Item = Self> {
        <Self as strum::IntoEnumIterator>::iter()
    }
}
