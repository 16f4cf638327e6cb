use crate::api::AppState;
use crate::api::middleware::AuthUser;
use crate::domain::event::SyncBatch;
use crate::error::Result;
use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SyncParams {
    #[serde(default)]
    pub last_seen_id: Option<Uuid>,
}

/// Resync over plain HTTP, for clients that catch up before opening the gateway.
///
/// # Errors
/// Returns `AppError::SyncFailed` on any internal failure.
pub async fn sync(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<SyncParams>,
) -> Result<Json<SyncBatch>> {
    Ok(Json(state.sync_service.sync(auth_user.user_id, params.last_seen_id).await?))
}
