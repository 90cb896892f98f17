//! Built-in agents. Their handlers return canned answers; only the routing
//! and escalation behaviour is meaningful.

mod billing;
mod international;

pub use billing::{
    DEFAULT_REFUND_THRESHOLD, LARGE_REFUND_ESCALATION, PLAN_CATALOG, billing_registry,
};
pub use international::international_registry;

use crate::agent::HandlerRegistry;
use crate::envelope::AgentKind;

pub fn registry_for(kind: AgentKind, refund_threshold: f64) -> HandlerRegistry {
    match kind {
        AgentKind::Billing => billing_registry(refund_threshold),
        AgentKind::International => international_registry(),
    }
}
