//! HTTP routes over the gateway dispatcher.
//!
//! ```text
//! GET    /                              welcome message
//! POST   /sessions                      create a session
//! GET    /sessions/{session_id}         session record
//! DELETE /sessions/{session_id}         close a session
//! POST   /{category}/requests?session_id=...   submit to billing | international
//! GET    /responses/{request_id}        response lookup
//! ```

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use switchboard_core::envelope::AgentKind;
use switchboard_core::gateway::{
    GatewayDispatcher, LookupResult, StoredResponse, SubmitReceipt, SubmitRequest,
};
use switchboard_core::session::SessionRecord;
use switchboard_core::types::{RequestId, SessionId};
use tracing::debug;

use crate::error::ApiError;

pub const WELCOME_MESSAGE: &str = "Welcome to the Switchboard request routing API";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayDispatcher>,
}

impl AppState {
    pub fn new(gateway: Arc<GatewayDispatcher>) -> Self {
        Self { gateway }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/sessions", post(create_session))
        .route(
            "/sessions/{session_id}",
            get(get_session).delete(close_session),
        )
        .route("/{category}/requests", post(submit_request))
        .route("/responses/{request_id}", get(get_response))
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(serde_json::json!({ "message": WELCOME_MESSAGE }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub customer_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub status: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<SessionStatus>, ApiError> {
    let record = state
        .gateway
        .create_session(&body.customer_id, body.user_id)
        .await?;
    Ok(Json(SessionStatus {
        session_id: record.session_id,
        status: "created".to_string(),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(state.gateway.session(&session_id).await?))
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<SessionStatus>, ApiError> {
    let record = state.gateway.close_session(&session_id).await?;
    Ok(Json(SessionStatus {
        session_id: record.session_id,
        status: "closed".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SubmitQuery {
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub customer_id: String,
    pub request_type: String,
    #[serde(default = "empty_details")]
    pub details: Value,
}

fn empty_details() -> Value {
    Value::Object(Map::new())
}

async fn submit_request(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Query(query): Query<SubmitQuery>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SubmitReceipt>, ApiError> {
    let agent =
        AgentKind::from_str(&category).map_err(|_| ApiError::UnknownCategory { category })?;
    let receipt = state
        .gateway
        .submit(SubmitRequest {
            session_id: query.session_id,
            customer_id: body.customer_id,
            agent,
            request_type: body.request_type,
            details: body.details,
        })
        .await?;
    Ok(Json(receipt))
}

#[derive(Debug, Serialize)]
pub struct ResponseLookup {
    pub request_id: RequestId,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<StoredResponse>,
}

async fn get_response(
    State(state): State<AppState>,
    Path(request_id): Path<RequestId>,
) -> Result<Json<ResponseLookup>, ApiError> {
    let (status, response) = match state.gateway.lookup(&request_id).await? {
        LookupResult::Completed(stored) => ("completed", Some(stored)),
        LookupResult::Pending => ("pending", None),
        LookupResult::NotFound => return Err(ApiError::ResponseNotFound { request_id }),
    };
    debug!(target: "http", %request_id, status, "Response lookup");
    Ok(Json(ResponseLookup {
        request_id,
        status,
        response,
    }))
}
