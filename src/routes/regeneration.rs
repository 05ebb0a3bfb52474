//! Regeneration HTTP endpoints.
//!
//! - GET    /api/v1/regeneration  current state and progress
//! - POST   /api/v1/regeneration  start a run in the background
//! - DELETE /api/v1/regeneration  cancel the running run

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::errors::{AppError, ErrorResponse};
use crate::services::regeneration::{RegenerationService, RegenerationState};

/// Acknowledgement of an accepted regeneration command.
#[derive(Debug, Serialize, ToSchema)]
pub struct RegenerationAccepted {
    pub message: String,
}

/// Get the regeneration status.
#[utoipa::path(
    get,
    path = "/api/v1/regeneration",
    tag = "Regeneration",
    responses(
        (status = 200, description = "Current regeneration state", body = RegenerationState),
    )
)]
pub async fn get_regeneration_status(
    State(service): State<Arc<RegenerationService>>,
) -> Json<RegenerationState> {
    Json(service.status().await)
}

/// Start a regeneration of the exposure window.
///
/// The run happens in the background; poll the GET endpoint for progress.
#[utoipa::path(
    post,
    path = "/api/v1/regeneration",
    tag = "Regeneration",
    responses(
        (status = 202, description = "Regeneration started", body = RegenerationAccepted),
        (status = 409, description = "A regeneration is already running", body = ErrorResponse),
    )
)]
pub async fn start_regeneration(
    State(service): State<Arc<RegenerationService>>,
) -> Result<(StatusCode, Json<RegenerationAccepted>), AppError> {
    service.trigger().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RegenerationAccepted {
            message: "Regeneration started".to_string(),
        }),
    ))
}

/// Cancel the running regeneration.
///
/// Batches already written are kept; the run stops at the next batch boundary.
#[utoipa::path(
    delete,
    path = "/api/v1/regeneration",
    tag = "Regeneration",
    responses(
        (status = 202, description = "Cancellation requested", body = RegenerationAccepted),
        (status = 404, description = "No regeneration is running", body = ErrorResponse),
    )
)]
pub async fn cancel_regeneration(
    State(service): State<Arc<RegenerationService>>,
) -> Result<(StatusCode, Json<RegenerationAccepted>), AppError> {
    if !service.cancel().await {
        return Err(AppError::NotFound(
            "No regeneration is running".to_string(),
        ));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(RegenerationAccepted {
            message: "Cancellation requested".to_string(),
        }),
    ))
}
