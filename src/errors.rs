use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::ExternalServiceError(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal database error".to_string(),
                )
            }
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}

/// Failures of a single computation unit. These never abort a regeneration
/// run; the affected location or instant is logged and skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputationError {
    #[error("Malformed location: {0}")]
    MalformedLocation(String),

    #[error("Invalid horizon profile: {0}")]
    InvalidProfile(String),

    #[error("Missing horizon profile for location {0}")]
    MissingProfile(uuid::Uuid),
}

impl From<crate::services::osm::OsmError> for AppError {
    fn from(err: crate::services::osm::OsmError) -> Self {
        AppError::InternalError(format!("OSM parsing error: {}", err))
    }
}

impl From<crate::services::store::StoreError> for AppError {
    fn from(err: crate::services::store::StoreError) -> Self {
        match err {
            crate::services::store::StoreError::Database(e) => AppError::DatabaseError(e),
            other => AppError::InternalError(other.to_string()),
        }
    }
}

impl From<ComputationError> for AppError {
    fn from(err: ComputationError) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl From<crate::services::engine::EngineError> for AppError {
    fn from(err: crate::services::engine::EngineError) -> Self {
        match err {
            crate::services::engine::EngineError::Store(e) => e.into(),
            other => AppError::InternalError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_409() {
        let resp = AppError::Conflict("already running".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let resp = AppError::NotFound("no such location".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_store_integrity_error_is_internal() {
        let err: AppError =
            crate::services::store::StoreError::Integrity("dangling instant".into()).into();
        assert!(matches!(err, AppError::InternalError(_)));
    }
}
