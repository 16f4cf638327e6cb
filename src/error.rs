use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Authentication failed")]
    AuthError,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not found")]
    NotFound,
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Rate limit exceeded, retry after {retry_after_secs}s (limit {limit})")]
    RateLimited { retry_after_secs: u64, limit: u32 },
    #[error("Sync failed, please refresh")]
    SyncFailed,
    #[error("Internal server error")]
    Internal,
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => Self::Unavailable(e.to_string()),
            other => Self::Database(other),
        }
    }
}

impl AppError {
    /// Stable machine-readable code shared by the REST and gateway surfaces.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Database(_) | Self::Internal => "internal",
            Self::Unavailable(_) => "unavailable",
            Self::AuthError => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::SyncFailed => "sync_failed",
        }
    }

    /// Message safe to show to the client. Infrastructure details stay in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Internal => "Internal server error".to_string(),
            Self::Unavailable(_) => "Service temporarily unavailable".to_string(),
            Self::AuthError => "Unauthorized".to_string(),
            Self::Forbidden => "Forbidden".to_string(),
            Self::NotFound => "Not found".to_string(),
            Self::BadRequest(msg) => msg.clone(),
            Self::RateLimited { .. } => "Too many messages".to_string(),
            Self::SyncFailed => "Sync failed, please refresh".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Database(e) => {
                tracing::error!(error = %e, "Database error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Unavailable(reason) => {
                tracing::error!(reason = %reason, "Backing store unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::AuthError => {
                tracing::debug!("Authentication failed");
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden => {
                tracing::debug!("Forbidden");
                StatusCode::FORBIDDEN
            }
            Self::NotFound => {
                tracing::debug!("Resource not found");
                StatusCode::NOT_FOUND
            }
            Self::BadRequest(msg) => {
                tracing::debug!(message = %msg, "Bad request");
                StatusCode::BAD_REQUEST
            }
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::SyncFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal => {
                tracing::error!("Internal server error occurred");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if let Self::RateLimited { retry_after_secs, limit } = self {
            let body = Json(json!({
                "error": self.public_message(),
                "retry_after_secs": retry_after_secs,
                "limit": limit,
            }));
            let mut response = (status, body).into_response();
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            return response;
        }

        let body = Json(json!({
            "error": self.public_message()
        }));

        (status, body).into_response()
    }
}
