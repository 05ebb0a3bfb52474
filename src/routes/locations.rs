//! Location HTTP endpoints.
//!
//! - GET  /api/v1/locations?lat=&lon=&radius=M&at=ISO8601&max_hours=N
//! - GET  /api/v1/locations/:id?at=ISO8601&max_hours=N
//! - GET  /api/v1/locations/:id/status?at=ISO8601&max_hours=N
//! - GET  /api/v1/locations/:id/next-sunny?from=ISO8601&max_hours=N
//! - POST /api/v1/locations/status

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::errors::{AppError, ErrorResponse};
use crate::routes::validate_point;
use crate::services::exposure::{LookaheadStatus, NextInstant, SunStatus};
use crate::services::status::{LocationStatus, QueryFacade};
use crate::services::store::Location;

/// Default look-ahead for next-change and next-sunny lookups (hours).
const DEFAULT_MAX_HOURS: u32 = 24;

/// Upper bound for `max_hours` (the forecast horizon).
const MAX_LOOKAHEAD_HOURS: u32 = 168;

/// Maximum number of ids in one batch request, and of locations returned by
/// a radius search.
const MAX_BATCH_LOCATIONS: usize = 500;

/// Default radius of a location search (metres).
const DEFAULT_RADIUS_M: f64 = 1000.0;

/// Largest accepted search radius (metres).
const MAX_RADIUS_M: f64 = 10_000.0;

const STALE_HEADER: &str = "X-Forecast-Stale";

// ---------------------------------------------------------------------------
// Query parameter / request structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatusQuery {
    /// Instant to evaluate in ISO 8601 format (defaults to now)
    pub at: Option<String>,
    /// Look-ahead for the next status change in hours (default 24, max 168)
    pub max_hours: Option<u32>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct NearbyQuery {
    /// Latitude of the search centre (WGS84)
    pub lat: f64,
    /// Longitude of the search centre (WGS84)
    pub lon: f64,
    /// Search radius in metres (default 1000, max 10000)
    pub radius: Option<f64>,
    /// Instant to evaluate in ISO 8601 format (defaults to now)
    pub at: Option<String>,
    /// Look-ahead for the next status change in hours (default 24, max 168)
    pub max_hours: Option<u32>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct NextSunnyQuery {
    /// Start of the search in ISO 8601 format (defaults to now)
    pub from: Option<String>,
    /// Search horizon in hours (default 24, max 168)
    pub max_hours: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchStatusRequest {
    /// Location UUIDs (at most 500)
    pub location_ids: Vec<Uuid>,
    /// Instant to evaluate in ISO 8601 format (defaults to now)
    pub at: Option<String>,
    /// Look-ahead for the next status change in hours (default 24, max 168)
    pub max_hours: Option<u32>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Sun status of one location.
#[derive(Debug, Serialize, ToSchema)]
pub struct LocationStatusResponse {
    /// Location UUID
    pub location_id: Uuid,
    /// Grid instant the status refers to (ISO 8601)
    pub instant: String,
    /// Clear-sky exposure from terrain and buildings (null = unknown)
    pub exposed: Option<bool>,
    /// Exposure after cloud cover (null = unknown)
    pub effective_exposed: Option<bool>,
    /// "sunny", "shady" or "unknown"
    pub status: SunStatus,
    /// Whether the forecast behind `effective_exposed` is stale
    pub forecast_stale: bool,
    /// Next instant whose known status differs (ISO 8601), null unless
    /// `next_change_status` is "found"
    pub next_change_at: Option<String>,
    /// Minutes from the requested time until `next_change_at`
    pub minutes_until_change: Option<i64>,
    /// "found", "none_within_horizon" (every instant of the look-ahead is
    /// known and the status holds) or "unknown" (missing data)
    pub next_change_status: LookaheadStatus,
}

impl LocationStatusResponse {
    fn new(status: LocationStatus, next: NextInstant, at: DateTime<Utc>) -> Self {
        let next_change = next.instant();
        Self {
            location_id: status.location_id,
            instant: status.instant.to_rfc3339(),
            exposed: status.exposed,
            effective_exposed: status.effective_exposed,
            status: status.status,
            forecast_stale: status.forecast_stale,
            next_change_at: next_change.map(|t| t.to_rfc3339()),
            minutes_until_change: next_change.map(|t| minutes_between(at, t)),
            next_change_status: next.status(),
        }
    }
}

/// Catalog entry of a location.
#[derive(Debug, Serialize, ToSchema)]
pub struct LocationInfo {
    /// Location UUID
    pub id: Uuid,
    /// OpenStreetMap node id, if imported from OSM
    pub osm_id: Option<i64>,
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Terrain elevation at the location (metres above sea level)
    pub ground_elevation_m: f64,
    /// Elevation of the observer's eyes (metres above sea level)
    pub observer_height_m: f64,
}

impl From<&Location> for LocationInfo {
    fn from(loc: &Location) -> Self {
        Self {
            id: loc.id,
            osm_id: loc.osm_id,
            name: loc.name.clone(),
            latitude: loc.lat,
            longitude: loc.lon,
            ground_elevation_m: loc.ground_elevation_m,
            observer_height_m: loc.observer_height_m,
        }
    }
}

/// A location found by a radius search, with its sun status.
#[derive(Debug, Serialize, ToSchema)]
pub struct NearbyLocationResponse {
    pub location: LocationInfo,
    /// Great-circle distance from the search centre (metres)
    pub distance_m: f64,
    pub sun: LocationStatusResponse,
}

/// Locations within the search radius, nearest first (at most 500).
#[derive(Debug, Serialize, ToSchema)]
pub struct NearbyLocationsResponse {
    pub locations: Vec<NearbyLocationResponse>,
}

/// One location with its sun status.
#[derive(Debug, Serialize, ToSchema)]
pub struct LocationDetailResponse {
    pub location: LocationInfo,
    pub sun: LocationStatusResponse,
}

/// Next sunny instant of one location.
#[derive(Debug, Serialize, ToSchema)]
pub struct NextSunnyResponse {
    /// Location UUID
    pub location_id: Uuid,
    /// Start of the search (ISO 8601)
    pub from: String,
    /// Search horizon in hours
    pub max_hours: u32,
    /// First sunny instant (ISO 8601), null unless `status` is "found"
    pub next_sunny_at: Option<String>,
    /// Minutes from `from` until `next_sunny_at`
    pub minutes_until: Option<i64>,
    /// "found", "none_within_horizon" or "unknown" (missing data)
    pub status: LookaheadStatus,
}

/// Statuses of several locations. Unknown ids are omitted.
#[derive(Debug, Serialize, ToSchema)]
pub struct BatchStatusResponse {
    pub statuses: Vec<LocationStatusResponse>,
}

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

fn parse_instant(raw: Option<&str>, name: &str) -> Result<DateTime<Utc>, AppError> {
    match raw {
        None => Ok(Utc::now()),
        Some(s) => s
            .parse::<DateTime<Utc>>()
            .map_err(|e| AppError::BadRequest(format!("Invalid {}: {}", name, e))),
    }
}

fn validate_max_hours(raw: Option<u32>) -> Result<Duration, AppError> {
    let hours = raw.unwrap_or(DEFAULT_MAX_HOURS);
    if hours == 0 || hours > MAX_LOOKAHEAD_HOURS {
        return Err(AppError::BadRequest(format!(
            "max_hours must be between 1 and {}",
            MAX_LOOKAHEAD_HOURS
        )));
    }
    Ok(Duration::hours(i64::from(hours)))
}

fn validate_radius(raw: Option<f64>) -> Result<f64, AppError> {
    let radius = raw.unwrap_or(DEFAULT_RADIUS_M);
    if !radius.is_finite() || radius <= 0.0 || radius > MAX_RADIUS_M {
        return Err(AppError::BadRequest(format!(
            "radius must be greater than 0 and at most {} metres",
            MAX_RADIUS_M
        )));
    }
    Ok(radius)
}

/// Whole minutes from `from` until `to`, never negative.
fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_minutes().max(0)
}

fn stale_headers(stale: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if stale {
        headers.insert(STALE_HEADER, HeaderValue::from_static("true"));
    }
    headers
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Find locations near a point, with their sun status.
///
/// Statuses and next changes are computed for all hits at once.
#[utoipa::path(
    get,
    path = "/api/v1/locations",
    tag = "Locations",
    params(NearbyQuery),
    responses(
        (status = 200, description = "Locations within the radius, nearest first", body = NearbyLocationsResponse),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse),
    )
)]
pub async fn list_nearby_locations(
    State(facade): State<Arc<QueryFacade>>,
    Query(params): Query<NearbyQuery>,
) -> Result<(HeaderMap, Json<NearbyLocationsResponse>), AppError> {
    validate_point(params.lat, params.lon)?;
    let radius = validate_radius(params.radius)?;
    let at = parse_instant(params.at.as_deref(), "at")?;
    let horizon = validate_max_hours(params.max_hours)?;

    let mut nearby = facade.locations_near(params.lat, params.lon, radius).await?;
    nearby.truncate(MAX_BATCH_LOCATIONS);
    let ids: Vec<Uuid> = nearby.iter().map(|n| n.location.id).collect();

    let mut statuses: HashMap<Uuid, LocationStatus> = facade
        .get_current_status_batch(&ids, at)
        .await
        .into_iter()
        .map(|s| (s.location_id, s))
        .collect();
    let changes = facade.get_next_change_batch(&ids, at, horizon).await;

    let any_stale = statuses.values().any(|s| s.forecast_stale);
    let locations = nearby
        .into_iter()
        .filter_map(|n| {
            let status = statuses.remove(&n.location.id)?;
            let next = changes
                .get(&n.location.id)
                .copied()
                .unwrap_or(NextInstant::Unknown);
            Some(NearbyLocationResponse {
                location: LocationInfo::from(&n.location),
                distance_m: (n.distance_m * 10.0).round() / 10.0,
                sun: LocationStatusResponse::new(status, next, at),
            })
        })
        .collect();

    Ok((stale_headers(any_stale), Json(NearbyLocationsResponse { locations })))
}

/// Get a location with its sun status.
#[utoipa::path(
    get,
    path = "/api/v1/locations/{id}",
    tag = "Locations",
    params(
        ("id" = Uuid, Path, description = "Location UUID"),
        StatusQuery,
    ),
    responses(
        (status = 200, description = "Location and its sun status", body = LocationDetailResponse),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
        (status = 404, description = "Location not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse),
    )
)]
pub async fn get_location(
    State(facade): State<Arc<QueryFacade>>,
    Path(id): Path<Uuid>,
    Query(params): Query<StatusQuery>,
) -> Result<(HeaderMap, Json<LocationDetailResponse>), AppError> {
    let at = parse_instant(params.at.as_deref(), "at")?;
    let horizon = validate_max_hours(params.max_hours)?;

    let location = facade
        .location_info(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Location {} not found", id)))?;
    let status = facade
        .get_current_status(id, at)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Location {} not found", id)))?;
    let next = facade
        .get_next_change(id, at, horizon)
        .await
        .unwrap_or(NextInstant::Unknown);

    let headers = stale_headers(status.forecast_stale);
    Ok((
        headers,
        Json(LocationDetailResponse {
            location: LocationInfo::from(&location),
            sun: LocationStatusResponse::new(status, next, at),
        }),
    ))
}

/// Get the sun status of a location.
///
/// Combines the precomputed clear-sky exposure with the cached cloud-cover
/// forecast. Sets `X-Forecast-Stale: true` when the forecast is stale.
#[utoipa::path(
    get,
    path = "/api/v1/locations/{id}/status",
    tag = "Locations",
    params(
        ("id" = Uuid, Path, description = "Location UUID"),
        StatusQuery,
    ),
    responses(
        (status = 200, description = "Current sun status", body = LocationStatusResponse,
         headers(
             ("X-Forecast-Stale" = String, description = "Set to 'true' when the cloud-cover forecast is stale")
         )),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
        (status = 404, description = "Location not found", body = ErrorResponse),
    )
)]
pub async fn get_location_status(
    State(facade): State<Arc<QueryFacade>>,
    Path(id): Path<Uuid>,
    Query(params): Query<StatusQuery>,
) -> Result<(HeaderMap, Json<LocationStatusResponse>), AppError> {
    let at = parse_instant(params.at.as_deref(), "at")?;
    let horizon = validate_max_hours(params.max_hours)?;

    let status = facade
        .get_current_status(id, at)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Location {} not found", id)))?;
    let next_change = facade
        .get_next_change(id, at, horizon)
        .await
        .unwrap_or(NextInstant::Unknown);

    let headers = stale_headers(status.forecast_stale);
    Ok((headers, Json(LocationStatusResponse::new(status, next_change, at))))
}

/// Find the next sunny instant of a location.
#[utoipa::path(
    get,
    path = "/api/v1/locations/{id}/next-sunny",
    tag = "Locations",
    params(
        ("id" = Uuid, Path, description = "Location UUID"),
        NextSunnyQuery,
    ),
    responses(
        (status = 200, description = "Next sunny instant, or why there is none", body = NextSunnyResponse),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
        (status = 404, description = "Location not found", body = ErrorResponse),
    )
)]
pub async fn get_next_sunny(
    State(facade): State<Arc<QueryFacade>>,
    Path(id): Path<Uuid>,
    Query(params): Query<NextSunnyQuery>,
) -> Result<Json<NextSunnyResponse>, AppError> {
    let from = parse_instant(params.from.as_deref(), "from")?;
    let horizon = validate_max_hours(params.max_hours)?;

    let next = facade
        .get_next_sunny_instant(id, from, horizon)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Location {} not found", id)))?;
    let next_sunny = next.instant();

    Ok(Json(NextSunnyResponse {
        location_id: id,
        from: from.to_rfc3339(),
        max_hours: horizon.num_hours() as u32,
        next_sunny_at: next_sunny.map(|t| t.to_rfc3339()),
        minutes_until: next_sunny.map(|t| minutes_between(from, t)),
        status: next.status(),
    }))
}

/// Get the sun status of several locations at once.
#[utoipa::path(
    post,
    path = "/api/v1/locations/status",
    tag = "Locations",
    request_body = BatchStatusRequest,
    responses(
        (status = 200, description = "Statuses of the known locations", body = BatchStatusResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
    )
)]
pub async fn get_batch_status(
    State(facade): State<Arc<QueryFacade>>,
    Json(request): Json<BatchStatusRequest>,
) -> Result<(HeaderMap, Json<BatchStatusResponse>), AppError> {
    if request.location_ids.is_empty() {
        return Err(AppError::BadRequest("location_ids must not be empty".to_string()));
    }
    if request.location_ids.len() > MAX_BATCH_LOCATIONS {
        return Err(AppError::BadRequest(format!(
            "at most {} location_ids per request",
            MAX_BATCH_LOCATIONS
        )));
    }
    let at = parse_instant(request.at.as_deref(), "at")?;
    let horizon = validate_max_hours(request.max_hours)?;

    let statuses = facade
        .get_current_status_batch(&request.location_ids, at)
        .await;
    let changes = facade
        .get_next_change_batch(&request.location_ids, at, horizon)
        .await;

    let any_stale = statuses.iter().any(|s| s.forecast_stale);
    let statuses = statuses
        .into_iter()
        .map(|s| {
            let next = changes
                .get(&s.location_id)
                .copied()
                .unwrap_or(NextInstant::Unknown);
            LocationStatusResponse::new(s, next, at)
        })
        .collect();

    Ok((stale_headers(any_stale), Json(BatchStatusResponse { statuses })))
}
