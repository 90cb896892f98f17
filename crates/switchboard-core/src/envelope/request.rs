use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use crate::types::{RequestId, SessionId};

/// Request type tag carried in the `type` field of a request envelope.
///
/// Unrecognised tags are preserved verbatim in [`RequestType::Other`] so that
/// they can be routed, reported and replayed without loss.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestType {
    BillingInquiry,
    UsageDiscrepancy,
    RefundRequest,
    PlanChange,
    RateInquiry,
    PackageActivation,
    RoamingActivation,
    Other(String),
}

impl RequestType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::BillingInquiry => "billing_inquiry",
            Self::UsageDiscrepancy => "usage_discrepancy",
            Self::RefundRequest => "refund_request",
            Self::PlanChange => "plan_change",
            Self::RateInquiry => "rate_inquiry",
            Self::PackageActivation => "package_activation",
            Self::RoamingActivation => "roaming_activation",
            Self::Other(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "billing_inquiry" => Self::BillingInquiry,
            "usage_discrepancy" => Self::UsageDiscrepancy,
            "refund_request" => Self::RefundRequest,
            "plan_change" => Self::PlanChange,
            "rate_inquiry" => Self::RateInquiry,
            "package_activation" => Self::PackageActivation,
            "roaming_activation" => Self::RoamingActivation,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<&str> for RequestType {
    fn from(tag: &str) -> Self {
        Self::parse(tag)
    }
}

impl From<String> for RequestType {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RequestType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequestType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingInquiry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inquiry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageDiscrepancy {
    pub reported_usage: f64,
    pub billed_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan: Option<String>,
    pub requested_plan: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateInquiry {
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageActivation {
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoamingActivation {
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
}

/// Structured payload of a request, keyed by its [`RequestType`].
///
/// `Opaque` keeps the raw JSON when the type is unknown or the payload does
/// not match the shape its type expects; handlers decide what that means.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestDetails {
    BillingInquiry(BillingInquiry),
    UsageDiscrepancy(UsageDiscrepancy),
    RefundRequest(RefundRequest),
    PlanChange(PlanChange),
    RateInquiry(RateInquiry),
    PackageActivation(PackageActivation),
    RoamingActivation(RoamingActivation),
    Opaque(Value),
}

impl RequestDetails {
    pub fn parse(request_type: &RequestType, details: Value) -> Self {
        match request_type {
            RequestType::BillingInquiry => typed(details, Self::BillingInquiry),
            RequestType::UsageDiscrepancy => typed(details, Self::UsageDiscrepancy),
            RequestType::RefundRequest => typed(details, Self::RefundRequest),
            RequestType::PlanChange => typed(details, Self::PlanChange),
            RequestType::RateInquiry => typed(details, Self::RateInquiry),
            RequestType::PackageActivation => typed(details, Self::PackageActivation),
            RequestType::RoamingActivation => typed(details, Self::RoamingActivation),
            RequestType::Other(_) => Self::Opaque(details),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::BillingInquiry(d) => serde_json::to_value(d),
            Self::UsageDiscrepancy(d) => serde_json::to_value(d),
            Self::RefundRequest(d) => serde_json::to_value(d),
            Self::PlanChange(d) => serde_json::to_value(d),
            Self::RateInquiry(d) => serde_json::to_value(d),
            Self::PackageActivation(d) => serde_json::to_value(d),
            Self::RoamingActivation(d) => serde_json::to_value(d),
            Self::Opaque(value) => Ok(value.clone()),
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }
}

fn typed<T, F>(details: Value, wrap: F) -> RequestDetails
where
    T: DeserializeOwned,
    F: FnOnce(T) -> RequestDetails,
{
    // A missing payload is treated as an empty object so that types whose
    // fields are all optional still parse.
    let candidate = if details.is_null() {
        Value::Object(Map::new())
    } else {
        details.clone()
    };
    match serde_json::from_value::<T>(candidate) {
        Ok(parsed) => wrap(parsed),
        Err(_) => RequestDetails::Opaque(details),
    }
}

/// A customer request travelling from the gateway to an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub customer_id: String,
    request_type: RequestType,
    details: RequestDetails,
    // What the sender put on the wire; encoding uses this so that fields the
    // typed view does not know about survive.
    raw_details: Value,
    pub timestamp: DateTime<Utc>,
}

impl RequestEnvelope {
    /// Builds a fresh request with a new id and the current time.
    pub fn new(
        session_id: SessionId,
        customer_id: impl Into<String>,
        request_type: RequestType,
        details: Value,
    ) -> Self {
        Self::from_parts(
            RequestId::new(),
            session_id,
            customer_id.into(),
            request_type,
            details,
            Utc::now(),
        )
    }

    pub fn from_parts(
        request_id: RequestId,
        session_id: SessionId,
        customer_id: String,
        request_type: RequestType,
        details: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            session_id,
            customer_id,
            details: RequestDetails::parse(&request_type, details.clone()),
            raw_details: details,
            request_type,
            timestamp,
        }
    }

    pub fn request_type(&self) -> &RequestType {
        &self.request_type
    }

    pub fn details(&self) -> &RequestDetails {
        &self.details
    }

    /// The details exactly as received, including keys the typed view drops.
    pub fn raw_details(&self) -> &Value {
        &self.raw_details
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(WireRequest::from_envelope(self))
    }
}

/// JSON shape of a request on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(rename = "type", default)]
    pub request_type: Option<String>,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl WireRequest {
    pub(crate) fn from_envelope(envelope: &RequestEnvelope) -> Self {
        Self {
            request_id: Some(envelope.request_id.to_string()),
            session_id: Some(envelope.session_id.to_string()),
            customer_id: Some(envelope.customer_id.clone()),
            request_type: Some(envelope.request_type.to_string()),
            details: envelope.raw_details.clone(),
            timestamp: Some(envelope.timestamp.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("billing_inquiry", RequestType::BillingInquiry)]
    #[case("refund_request", RequestType::RefundRequest)]
    #[case("roaming_activation", RequestType::RoamingActivation)]
    #[case("fax_request", RequestType::Other("fax_request".to_string()))]
    fn request_type_tags(#[case] tag: &str, #[case] expected: RequestType) {
        let parsed = RequestType::parse(tag);
        assert_eq!(parsed, expected);
        assert_eq!(parsed.as_str(), tag);
    }

    #[test]
    fn refund_details_parse_into_typed_variant() {
        let details = RequestDetails::parse(
            &RequestType::RefundRequest,
            json!({"amount": 42.5, "reason": "double charge"}),
        );
        assert_eq!(
            details,
            RequestDetails::RefundRequest(RefundRequest {
                amount: 42.5,
                reason: Some("double charge".to_string()),
            })
        );
    }

    #[test]
    fn mismatched_details_fall_back_to_opaque() {
        let raw = json!({"amount": "lots"});
        let details = RequestDetails::parse(&RequestType::RefundRequest, raw.clone());
        assert_eq!(details, RequestDetails::Opaque(raw));
    }

    #[test]
    fn null_details_parse_for_all_optional_types() {
        let details = RequestDetails::parse(&RequestType::BillingInquiry, Value::Null);
        assert_eq!(
            details,
            RequestDetails::BillingInquiry(BillingInquiry::default())
        );
    }

    #[test]
    fn typed_details_keep_extra_keys_on_the_wire() {
        let raw = json!({"amount": 50.0, "reason": "x", "account_number": "A-1"});
        let request = RequestEnvelope::new(
            SessionId::from_string("s"),
            "c",
            RequestType::RefundRequest,
            raw.clone(),
        );
        assert!(matches!(request.details(), RequestDetails::RefundRequest(_)));
        assert_eq!(request.raw_details(), &raw);
        assert_eq!(request.to_value().unwrap()["details"], raw);
    }

    #[test]
    fn null_details_stay_null_on_the_wire() {
        let request = RequestEnvelope::new(
            SessionId::from_string("s"),
            "c",
            RequestType::BillingInquiry,
            Value::Null,
        );
        assert!(matches!(request.details(), RequestDetails::BillingInquiry(_)));
        assert_eq!(request.to_value().unwrap()["details"], Value::Null);
    }

    #[test]
    fn unknown_type_keeps_payload_verbatim() {
        let raw = json!({"anything": [1, 2, 3]});
        let details =
            RequestDetails::parse(&RequestType::Other("custom".to_string()), raw.clone());
        assert_eq!(details.to_value().unwrap(), raw);
    }
}
