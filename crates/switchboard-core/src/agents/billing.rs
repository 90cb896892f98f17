use serde_json::json;

use crate::agent::{HandlerError, HandlerOutcome, HandlerRegistry};
use crate::envelope::{RequestDetails, RequestEnvelope, ResponseEnvelope};

pub const DEFAULT_REFUND_THRESHOLD: f64 = 100.0;
pub const LARGE_REFUND_ESCALATION: &str = "Large refund request";

pub const PLAN_CATALOG: &[&str] = &[
    "Basic 5GB",
    "Standard 20GB",
    "Premium 100GB",
    "Unlimited Data",
    "Family Plan 50GB",
    "Business Pro 200GB",
];

/// Handlers for `billing_requests`. Refunds strictly above
/// `refund_threshold` are escalated instead of approved.
pub fn billing_registry(refund_threshold: f64) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("billing_inquiry", billing_inquiry)
        .register_fn("usage_discrepancy", usage_discrepancy)
        .register_fn("refund_request", move |request| {
            refund_request(request, refund_threshold)
        })
        .register_fn("plan_change", plan_change);
    registry
}

fn mismatched(request: &RequestEnvelope) -> HandlerError {
    HandlerError::invalid_details(request.request_type(), "details do not match request type")
}

fn billing_inquiry(request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError> {
    let RequestDetails::BillingInquiry(details) = request.details() else {
        return Err(mismatched(request));
    };
    let topic = details.inquiry.as_deref().unwrap_or("your account");

    Ok(ResponseEnvelope::success(request.request_id.clone())
        .with("response", format!("Processed billing inquiry regarding {topic}"))
        .with("customer_id", request.customer_id.clone())
        .into())
}

fn usage_discrepancy(request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError> {
    let RequestDetails::UsageDiscrepancy(details) = request.details() else {
        return Err(mismatched(request));
    };

    let overbilled = details.billed_usage - details.reported_usage;
    let resolution = if overbilled > 0.0 {
        json!({
            "action": "credit",
            "amount": overbilled,
            "reason": "Usage discrepancy correction",
        })
    } else {
        json!({
            "action": "verified",
            "message": "Billing is correct based on usage records",
        })
    };

    Ok(ResponseEnvelope::success(request.request_id.clone())
        .with("resolution", resolution)
        .into())
}

fn refund_request(
    request: &RequestEnvelope,
    threshold: f64,
) -> Result<HandlerOutcome, HandlerError> {
    let RequestDetails::RefundRequest(details) = request.details() else {
        return Err(mismatched(request));
    };
    if details.amount < 0.0 {
        return Err(HandlerError::invalid_details(
            request.request_type(),
            format!("refund amount {} is negative", details.amount),
        ));
    }

    if details.amount > threshold {
        return Ok(HandlerOutcome::escalate(
            ResponseEnvelope::pending(request.request_id.clone())
                .with("message", "Refund request escalated to supervisor for approval"),
            LARGE_REFUND_ESCALATION,
        ));
    }

    Ok(ResponseEnvelope::success(request.request_id.clone())
        .with("action", "refund_approved")
        .with("amount", details.amount)
        .with("reason", details.reason.clone())
        .into())
}

fn plan_change(request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError> {
    let RequestDetails::PlanChange(details) = request.details() else {
        return Err(mismatched(request));
    };

    if !PLAN_CATALOG.contains(&details.requested_plan.as_str()) {
        return Ok(ResponseEnvelope::error(
            request.request_id.clone(),
            format!("Plan {} does not exist", details.requested_plan),
        )
        .into());
    }

    Ok(ResponseEnvelope::success(request.request_id.clone())
        .with("action", "plan_changed")
        .with("old_plan", details.current_plan.clone())
        .with("new_plan", details.requested_plan.clone())
        .with(
            "effective_date",
            request.timestamp.date_naive().to_string(),
        )
        .into())
}
