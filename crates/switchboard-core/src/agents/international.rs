use crate::agent::{HandlerError, HandlerOutcome, HandlerRegistry};
use crate::envelope::{RequestDetails, RequestEnvelope, ResponseEnvelope};

const STANDARD_RATE: f64 = 1.50;
const DEFAULT_ROAMING_DAYS: u32 = 7;

/// Per-minute rates for destinations with a negotiated tariff.
const RATES: &[(&str, f64)] = &[
    ("US", 0.25),
    ("UK", 0.30),
    ("France", 0.35),
    ("Germany", 0.35),
    ("India", 0.45),
    ("Japan", 0.60),
];

pub fn international_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("rate_inquiry", rate_inquiry)
        .register_fn("package_activation", package_activation)
        .register_fn("roaming_activation", roaming_activation);
    registry
}

fn mismatched(request: &RequestEnvelope) -> HandlerError {
    HandlerError::invalid_details(request.request_type(), "details do not match request type")
}

fn rate_for(destination: &str) -> f64 {
    RATES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(destination))
        .map_or(STANDARD_RATE, |(_, rate)| *rate)
}

fn rate_inquiry(request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError> {
    let RequestDetails::RateInquiry(details) = request.details() else {
        return Err(mismatched(request));
    };

    Ok(ResponseEnvelope::success(request.request_id.clone())
        .with("destination", details.destination.clone())
        .with("rate_per_minute", rate_for(&details.destination))
        .with("currency", "USD")
        .into())
}

fn package_activation(request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError> {
    let RequestDetails::PackageActivation(details) = request.details() else {
        return Err(mismatched(request));
    };
    if details.package.trim().is_empty() {
        return Err(HandlerError::invalid_details(
            request.request_type(),
            "package name is empty",
        ));
    }

    Ok(ResponseEnvelope::success(request.request_id.clone())
        .with("action", "package_activated")
        .with("package", details.package.clone())
        .with("destination", details.destination.clone())
        .into())
}

fn roaming_activation(request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError> {
    let RequestDetails::RoamingActivation(details) = request.details() else {
        return Err(mismatched(request));
    };

    Ok(ResponseEnvelope::success(request.request_id.clone())
        .with("action", "roaming_activated")
        .with("country", details.country.clone())
        .with("days", details.days.unwrap_or(DEFAULT_ROAMING_DAYS))
        .into())
}
