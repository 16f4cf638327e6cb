use crate::api::AppState;
use crate::api::middleware::AuthUser;
use crate::domain::event::{EditPayload, SendPayload};
use crate::domain::message::Message;
use crate::error::Result;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub content: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub plaintext: Option<String>,
}

/// Sends a message. The body has the same shape as a gateway `send` frame.
///
/// # Errors
/// Returns `AppError::BadRequest` for an invalid body or target,
/// `AppError::Forbidden` if the sender may not post to the scope and
/// `AppError::RateLimited` when the sender's window is full.
pub async fn send_message(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<SendPayload>,
) -> Result<(StatusCode, Json<Message>)> {
    let outbound = payload.into_outbound()?;
    let message = state.message_service.send(auth_user.user_id, outbound).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// # Errors
/// Returns `AppError::Forbidden` unless the caller sent the message.
pub async fn edit_message(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Json(body): Json<EditRequest>,
) -> Result<Json<Message>> {
    let edit = EditPayload { message_id, content: body.content, nonce: body.nonce, plaintext: body.plaintext };
    let message = state.message_service.edit(auth_user.user_id, edit).await?;
    Ok(Json(message))
}

/// # Errors
/// Returns `AppError::Forbidden` unless the caller sent the message.
pub async fn delete_message(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Message>> {
    Ok(Json(state.message_service.delete(auth_user.user_id, message_id).await?))
}

/// # Errors
/// Returns `AppError::Forbidden` unless the caller is the message's receiver.
pub async fn mark_read(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Message>> {
    Ok(Json(state.message_service.mark_read(auth_user.user_id, message_id).await?))
}
