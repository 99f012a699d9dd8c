//! Conversation routes
//!
//! Real-time delivery happens over the WebSocket; these routes let a client
//! start a conversation and catch up on what it missed while offline.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use murmur_relay::{AuthError, Identity, MessageStore, StoreError, TokenValidator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::ErrorResponse;
use crate::messages::HistoryEntry;
use crate::server::AppState;

/// Upper bound on one history page
const MAX_HISTORY_LIMIT: u32 = 500;

/// Create the conversations router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/conversations", post(create_conversation_handler))
        .route(
            "/api/v1/conversations/:conversation_id/messages",
            get(history_handler),
        )
        .with_state(state)
}

// === Request/Response Types ===

/// Request body for creating a conversation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub participant_ids: Vec<Identity>,
}

/// Query parameters for history
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Response for history
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub conversation_id: String,
    pub messages: Vec<HistoryEntry>,
}

/// Conversation route errors
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(AuthError),
    Forbidden(String),
    NotFound(String),
    InvalidInput(String),
    Store(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized(e) => (StatusCode::UNAUTHORIZED, "unauthorized", e.to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg),
            ApiError::Store(e) => {
                error!("Conversation store failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", e.to_string())
            }
        };
        ErrorResponse::new(code, &message).respond(status)
    }
}

/// Resolve the caller from an `Authorization: Bearer` header
fn bearer_identity(headers: &HeaderMap, state: &AppState) -> Result<Identity, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized(AuthError::MissingToken))?;

    state.validator.validate(token).map_err(|e| {
        warn!("Rejected bearer token: {}", e);
        ApiError::Unauthorized(e)
    })
}

/// POST /api/v1/conversations
///
/// The caller is always a participant.
async fn create_conversation_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = bearer_identity(&headers, &state)?;

    let mut participants = request.participant_ids;
    if participants.iter().all(|p| *p == caller) {
        return Err(ApiError::InvalidInput(
            "a conversation needs at least one other participant".into(),
        ));
    }
    participants.push(caller.clone());

    let conversation = state
        .repository
        .create_conversation(request.name.as_deref(), &participants)
        .await
        .map_err(ApiError::Store)?;

    info!(
        conversation_id = %conversation.id,
        creator = %caller,
        participants = conversation.participant_ids.len(),
        "Conversation created"
    );
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /api/v1/conversations/:conversation_id/messages
///
/// Returns the caller's own copies, oldest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = bearer_identity(&headers, &state)?;

    let members = state
        .repository
        .conversation_members(&conversation_id)
        .await
        .map_err(ApiError::Store)?
        .ok_or_else(|| ApiError::NotFound(format!("conversation {conversation_id}")))?;
    if !members.contains(&caller) {
        return Err(ApiError::Forbidden(format!(
            "{caller} is not a participant of {conversation_id}"
        )));
    }

    let messages = state
        .repository
        .history(&conversation_id, &caller, query.limit.clamp(1, MAX_HISTORY_LIMIT))
        .await
        .map_err(ApiError::Store)?;

    Ok(Json(HistoryResponse {
        conversation_id,
        messages,
    }))
}
