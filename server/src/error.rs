//! Error types for the shard server.
//!
//! Failures are caught at the smallest enclosing scope (per zone, per
//! subscriber, per connection) and translated into one of the types here;
//! nothing crosses a scope boundary unclassified.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Persistence gateway errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation or comparable conflict. State unchanged.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection or I/O failure. The enclosing zone transaction rolls back
    /// and the zone is retried on the next tick.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failure raised by a game module during `on_tick` or `player_state`.
#[derive(Debug, Error)]
#[error("game module error: {message}")]
pub struct ModuleError {
    message: String,
}

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result type for game module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Why one zone's tick pipeline failed. Other zones are unaffected.
#[derive(Debug, Error)]
pub enum ZoneTickError {
    #[error("zone {0} no longer exists")]
    ZoneGone(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// Top-level server errors. Reaching `main` with one of these initiates a
/// clean shutdown.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown game module: {0}")]
    UnknownModule(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server lifecycle operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// HTTP API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("debug access required")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            // Transient storage trouble surfaces as service-unavailable.
            StoreError::Backend(msg) => ApiError::Storage(msg),
        }
    }
}

/// JSON body returned for every API error.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_status_codes() {
        assert_eq!(
            ApiError::NotFound("zone".to_string())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict("name taken".to_string())
                .into_response()
                .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn store_error_maps_to_api_error() {
        let api: ApiError = StoreError::Conflict("duplicate zone name".to_string()).into();
        assert!(matches!(api, ApiError::Conflict(_)));

        let api: ApiError = StoreError::Backend("connection reset".to_string()).into();
        assert!(matches!(api, ApiError::Storage(_)));
        assert_eq!(api.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn internal_error_is_not_a_storage_error() {
        let api = ApiError::Internal("hashing failed".to_string());
        assert_eq!(
            api.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
