//! Weather HTTP endpoints.
//!
//! - GET  /api/v1/weather/status      refresher state and cached regions
//! - GET  /api/v1/weather/forecast    cached hourly forecast for a point
//! - GET  /api/v1/weather/is-sunny    sky at one instant for a point
//! - GET  /api/v1/weather/next-sunny  first clear hour for a point
//! - POST /api/v1/weather/refresh     start a refresh cycle now
//!
//! These answer from the forecast cache only; terrain and buildings are
//! ignored.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use utoipa::{IntoParams, ToSchema};

use crate::errors::{AppError, ErrorResponse};
use crate::routes::validate_point;
use crate::helpers::floor_to_hour;
use crate::services::exposure::NextInstant;
use crate::services::poller::{RefresherState, SharedRefresherState};
use crate::services::weather::{RegionId, RegionSummary, SkyLookup, WeatherForecastCache};

/// Default span of the forecast summary (hours).
const DEFAULT_FORECAST_HOURS: u32 = 24;

/// Default horizon of the weather-only next-sunny search (hours).
const DEFAULT_NEXT_SUNNY_HOURS: u32 = 48;

/// Upper bound for `hours` (the forecast horizon).
const MAX_FORECAST_HOURS: u32 = 168;

#[derive(Clone)]
pub struct WeatherState {
    pub cache: Arc<WeatherForecastCache>,
    pub refresher: SharedRefresherState,
    /// Wakes the background refresher.
    pub refresh: Arc<Notify>,
}

// ---------------------------------------------------------------------------
// Query parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct ForecastQuery {
    /// Latitude (WGS84)
    pub lat: f64,
    /// Longitude (WGS84)
    pub lon: f64,
    /// Hours from now to include (default 24 for the forecast, 48 for
    /// next-sunny; max 168)
    pub hours: Option<u32>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SkyQuery {
    /// Latitude (WGS84)
    pub lat: f64,
    /// Longitude (WGS84)
    pub lon: f64,
    /// Instant in ISO 8601 format (defaults to now)
    pub at: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct WeatherStatusResponse {
    /// Background refresher state and per-region results of the last cycle
    pub refresher: RefresherState,
    /// Cached forecast regions
    pub regions: Vec<RegionSummary>,
}

/// One forecast hour.
#[derive(Debug, Serialize, ToSchema)]
pub struct ForecastHourResponse {
    /// Start of the hour (ISO 8601)
    pub hour: String,
    /// Total cloud cover in percent
    pub cloud_cover_pct: f64,
    /// Sunshine duration within the hour in seconds, when reported
    pub sunshine_seconds: Option<f64>,
    /// Cloud cover is below the sunny threshold
    pub sunny: bool,
}

/// Cached forecast of the region containing the requested point.
#[derive(Debug, Serialize, ToSchema)]
pub struct ForecastResponse {
    pub region_id: RegionId,
    pub region: String,
    /// Last successful fetch (null when nothing is cached)
    pub fetched_at: Option<String>,
    /// Forecast is older than its TTL or its last refresh failed
    pub stale: bool,
    pub hours: Vec<ForecastHourResponse>,
}

/// Sky verdict for one hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkyStatus {
    Sunny,
    Cloudy,
    /// The forecast does not cover the hour, or nothing is cached
    NoData,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IsSunnyResponse {
    /// Instant asked about (ISO 8601)
    pub at: String,
    /// "sunny", "cloudy" or "no_data"
    pub status: SkyStatus,
    pub stale: bool,
}

/// Outcome of a weather-only search for a clear hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SunnyPeriodStatus {
    Found,
    /// Every hour of the horizon is forecast cloudy
    NoSunnyPeriod,
    /// No clear hour, but part of the horizon is not covered
    Unknown,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WeatherNextSunnyResponse {
    /// "found", "no_sunny_period" or "unknown"
    pub status: SunnyPeriodStatus,
    /// Start of the first clear hour (ISO 8601), null unless found
    pub next_sunny_at: Option<String>,
    /// Minutes from now until `next_sunny_at`
    pub minutes_until: Option<i64>,
    /// Search horizon in hours
    pub hours: u32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefreshAccepted {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

fn validate_hours(raw: Option<u32>, default: u32) -> Result<u32, AppError> {
    let hours = raw.unwrap_or(default);
    if hours == 0 || hours > MAX_FORECAST_HOURS {
        return Err(AppError::BadRequest(format!(
            "hours must be between 1 and {}",
            MAX_FORECAST_HOURS
        )));
    }
    Ok(hours)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Get the weather refresher and forecast cache status.
#[utoipa::path(
    get,
    path = "/api/v1/weather/status",
    tag = "Weather",
    responses(
        (status = 200, description = "Refresher and cache status", body = WeatherStatusResponse),
    )
)]
pub async fn get_weather_status(State(state): State<WeatherState>) -> Json<WeatherStatusResponse> {
    let refresher = state.refresher.read().await.clone();
    let regions = state.cache.snapshot(Utc::now()).await;
    Json(WeatherStatusResponse { refresher, regions })
}

/// Get the cached hourly forecast for a point.
#[utoipa::path(
    get,
    path = "/api/v1/weather/forecast",
    tag = "Weather",
    params(ForecastQuery),
    responses(
        (status = 200, description = "Cached forecast hours from now on", body = ForecastResponse),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
    )
)]
pub async fn get_forecast(
    State(state): State<WeatherState>,
    Query(params): Query<ForecastQuery>,
) -> Result<Json<ForecastResponse>, AppError> {
    validate_point(params.lat, params.lon)?;
    let hours = validate_hours(params.hours, DEFAULT_FORECAST_HOURS)?;
    let now = Utc::now();
    Ok(Json(forecast_for(&state.cache, params.lat, params.lon, hours, now).await))
}

async fn forecast_for(
    cache: &WeatherForecastCache,
    lat: f64,
    lon: f64,
    hours: u32,
    now: DateTime<Utc>,
) -> ForecastResponse {
    let region = cache.region_for(lat, lon);
    let start = floor_to_hour(now);
    let window = cache
        .forecast_window(region, start, start + Duration::hours(i64::from(hours)), now)
        .await;
    let (fetched_at, stale, hours) = match window {
        Some(w) => (
            Some(w.fetched_at.to_rfc3339()),
            w.stale,
            w.hours
                .iter()
                .map(|h| ForecastHourResponse {
                    hour: h.hour.to_rfc3339(),
                    cloud_cover_pct: h.cloud_cover_pct,
                    sunshine_seconds: h.sunshine_seconds,
                    sunny: cache.is_sunny(h),
                })
                .collect(),
        ),
        None => (None, false, Vec::new()),
    };
    ForecastResponse {
        region_id: region,
        region: region.to_string(),
        fetched_at,
        stale,
        hours,
    }
}

/// Check whether the sky is clear at a point and time.
#[utoipa::path(
    get,
    path = "/api/v1/weather/is-sunny",
    tag = "Weather",
    params(SkyQuery),
    responses(
        (status = 200, description = "Sky at the requested hour", body = IsSunnyResponse),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
    )
)]
pub async fn is_sunny_at(
    State(state): State<WeatherState>,
    Query(params): Query<SkyQuery>,
) -> Result<Json<IsSunnyResponse>, AppError> {
    validate_point(params.lat, params.lon)?;
    let now = Utc::now();
    let at = match params.at.as_deref() {
        None => now,
        Some(s) => s
            .parse::<DateTime<Utc>>()
            .map_err(|e| AppError::BadRequest(format!("Invalid at: {}", e)))?,
    };

    let region = state.cache.region_for(params.lat, params.lon);
    let (status, stale) = match state.cache.lookup(region, at, now).await {
        SkyLookup::Sunny { stale } => (SkyStatus::Sunny, stale),
        SkyLookup::Cloudy { stale } => (SkyStatus::Cloudy, stale),
        SkyLookup::Missing { stale } => (SkyStatus::NoData, stale),
        SkyLookup::Unavailable => (SkyStatus::NoData, false),
    };
    Ok(Json(IsSunnyResponse {
        at: at.to_rfc3339(),
        status,
        stale,
    }))
}

/// Find the first clear hour at a point, from the forecast alone.
#[utoipa::path(
    get,
    path = "/api/v1/weather/next-sunny",
    tag = "Weather",
    params(ForecastQuery),
    responses(
        (status = 200, description = "First clear hour, or why there is none", body = WeatherNextSunnyResponse),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
    )
)]
pub async fn get_weather_next_sunny(
    State(state): State<WeatherState>,
    Query(params): Query<ForecastQuery>,
) -> Result<Json<WeatherNextSunnyResponse>, AppError> {
    validate_point(params.lat, params.lon)?;
    let hours = validate_hours(params.hours, DEFAULT_NEXT_SUNNY_HOURS)?;
    let now = Utc::now();
    Ok(Json(
        next_sunny_for(&state.cache, params.lat, params.lon, hours, now).await,
    ))
}

async fn next_sunny_for(
    cache: &WeatherForecastCache,
    lat: f64,
    lon: f64,
    hours: u32,
    now: DateTime<Utc>,
) -> WeatherNextSunnyResponse {
    let region = cache.region_for(lat, lon);
    let next = cache
        .next_sunny_hour(region, now, now + Duration::hours(i64::from(hours)))
        .await;
    let status = match next {
        NextInstant::Found(_) => SunnyPeriodStatus::Found,
        NextInstant::NoneWithinHorizon => SunnyPeriodStatus::NoSunnyPeriod,
        NextInstant::Unknown => SunnyPeriodStatus::Unknown,
    };
    let found = next.instant();
    WeatherNextSunnyResponse {
        status,
        next_sunny_at: found.map(|t| t.to_rfc3339()),
        minutes_until: found.map(|t| (t - now).num_minutes().max(0)),
        hours,
    }
}

/// Start a forecast refresh cycle now.
///
/// The cycle runs in the background; poll the status endpoint for results.
#[utoipa::path(
    post,
    path = "/api/v1/weather/refresh",
    tag = "Weather",
    responses(
        (status = 202, description = "Refresh requested", body = RefreshAccepted),
    )
)]
pub async fn trigger_refresh(
    State(state): State<WeatherState>,
) -> (StatusCode, Json<RefreshAccepted>) {
    state.refresh.notify_one();
    (
        StatusCode::ACCEPTED,
        Json(RefreshAccepted {
            message: "Weather refresh requested".to_string(),
        }),
    )
}
