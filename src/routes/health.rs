use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::services::regeneration::RegenerationService;

#[derive(Clone)]
pub struct HealthState {
    pub pool: PgPool,
    pub regeneration: Arc<RegenerationService>,
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the database is unreachable, no exposure
    /// data has been computed yet, or the last regeneration reported an error
    pub status: String,
    /// API version
    pub version: String,
    /// Whether the database is reachable
    pub database: bool,
    /// Whether a regeneration is currently running
    pub regenerating: bool,
    /// Completion time of the last regeneration run
    pub last_regeneration_at: Option<DateTime<Utc>>,
    /// Error of the last regeneration run, including failed batch writes
    pub last_regeneration_error: Option<String>,
}

fn overall_status(db_ok: bool, last_run: Option<DateTime<Utc>>, last_error: Option<&str>) -> &'static str {
    if db_ok && last_run.is_some() && last_error.is_none() {
        "ok"
    } else {
        "degraded"
    }
}

/// Health check endpoint.
///
/// Always 200; load balancers read `status` to tell partial failures apart.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();
    let regen = state.regeneration.status().await;

    Json(HealthResponse {
        status: overall_status(db_ok, regen.finished_at, regen.last_error.as_deref()).to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_ok,
        regenerating: regen.running,
        last_regeneration_at: regen.finished_at,
        last_regeneration_error: regen.last_error,
    })
}
