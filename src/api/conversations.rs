use crate::api::AppState;
use crate::api::middleware::AuthUser;
use crate::domain::conversation::Conversation;
use crate::domain::message::{Message, Scope};
use crate::error::Result;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub peer_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub before: Option<OffsetDateTime>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Returns the caller's conversation with `peer_id`, creating it on first contact.
///
/// # Errors
/// Propagates store failures.
pub async fn create_conversation(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>> {
    Ok(Json(state.conversation_service.resolve(auth_user.user_id, body.peer_id).await?))
}

/// # Errors
/// Returns `AppError::Forbidden` if the caller is not a participant.
pub async fn conversation_history(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Message>>> {
    let page = state
        .message_service
        .history(auth_user.user_id, Scope::Conversation(conversation_id), params.before, params.limit)
        .await?;
    Ok(Json(page))
}

/// # Errors
/// Returns `AppError::Forbidden` if the caller is not a member of the group.
pub async fn group_history(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Message>>> {
    let page =
        state.message_service.history(auth_user.user_id, Scope::Group(group_id), params.before, params.limit).await?;
    Ok(Json(page))
}
