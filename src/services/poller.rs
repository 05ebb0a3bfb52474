//! Background weather refresher.
//!
//! Keeps the region forecast cache warm independently of any request:
//! - Collects the distinct regions of all catalog locations
//! - Refreshes each region through the cache with bounded concurrency
//! - Persists the hours each fetch returned so a restart can warm the cache
//! - Prunes entries older than the forecast horizon
//!
//! A cycle also starts early when the refresh trigger is notified.
//!
//! State is in-memory (`Arc<RwLock<RefresherState>>`) and exposed through the
//! weather status endpoint.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use utoipa::ToSchema;

use crate::db::queries;
use crate::services::store::{Location, LocationCatalog};
use crate::services::weather::{
    ForecastHour, ForecastSource, RefreshOutcome, RegionId, WeatherForecastCache,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Regions fetched from the forecast source at the same time.
const REFRESH_CONCURRENCY: usize = 4;

/// Sleep after a cycle that could not even list locations (seconds).
const REFRESH_ERROR_SLEEP_SECS: u64 = 60;

/// Forecast entries older than this are dropped (hours).
const FORECAST_RETENTION_HOURS: i64 = 168;

// ---------------------------------------------------------------------------
// Refresher state (in-memory, shared via Arc<RwLock<>>)
// ---------------------------------------------------------------------------

/// Result of the last refresh of one region.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RegionRefreshStatus {
    pub region_id: RegionId,
    pub region: String,
    /// Locations sharing this region's forecast.
    pub locations: usize,
    /// "fetched", "stale" (fetch failed, previous data kept) or "unavailable"
    pub last_result: String,
    pub hours: usize,
    pub error: Option<String>,
}

/// Global refresher state, exposed via the weather status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RefresherState {
    pub active: bool,
    pub next_wakeup_at: Option<DateTime<Utc>>,
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub total_cycles: u64,
    pub regions: Vec<RegionRefreshStatus>,
}

impl RefresherState {
    pub fn new() -> Self {
        Self {
            active: true,
            next_wakeup_at: None,
            last_cycle_completed_at: None,
            last_cycle_duration_ms: None,
            total_cycles: 0,
            regions: Vec::new(),
        }
    }
}

impl Default for RefresherState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared refresher state handle.
pub type SharedRefresherState = Arc<RwLock<RefresherState>>;

/// Refresh of one region within a cycle.
#[derive(Debug, Clone)]
pub struct RegionRefresh {
    pub status: RegionRefreshStatus,
    /// Hours returned by this fetch; empty when it failed.
    pub fetched: Vec<ForecastHour>,
}

// ---------------------------------------------------------------------------
// Refresh cycle
// ---------------------------------------------------------------------------

/// Group locations by forecast region, counting members.
pub fn regions_for(cache: &WeatherForecastCache, locations: &[Location]) -> BTreeMap<RegionId, usize> {
    let mut regions = BTreeMap::new();
    for loc in locations {
        if !loc.lat.is_finite() || !loc.lon.is_finite() {
            continue;
        }
        *regions.entry(cache.region_for(loc.lat, loc.lon)).or_insert(0) += 1;
    }
    regions
}

/// Refresh every region once. A failing region never affects the others.
pub async fn refresh_cycle(
    cache: &WeatherForecastCache,
    source: &dyn ForecastSource,
    locations: &[Location],
    now: DateTime<Utc>,
) -> Vec<RegionRefresh> {
    let regions = regions_for(cache, locations);

    let mut refreshes: Vec<RegionRefresh> = stream::iter(regions)
        .map(|(region, members)| async move {
            let outcome = cache.refresh_region(source, region, now).await;
            build_region_refresh(region, members, outcome)
        })
        .buffer_unordered(REFRESH_CONCURRENCY)
        .collect()
        .await;

    refreshes.sort_by_key(|r| r.status.region_id);
    refreshes
}

fn build_region_refresh(region: RegionId, members: usize, outcome: RefreshOutcome) -> RegionRefresh {
    let (last_result, fetched, error) = match outcome {
        RefreshOutcome::Fetched { hours } => ("fetched", hours, None),
        RefreshOutcome::FailedServingStale(e) => ("stale", Vec::new(), Some(e)),
        RefreshOutcome::FailedNoData(e) => ("unavailable", Vec::new(), Some(e)),
    };
    RegionRefresh {
        status: RegionRefreshStatus {
            region_id: region,
            region: region.to_string(),
            locations: members,
            last_result: last_result.to_string(),
            hours: fetched.len(),
            error,
        },
        fetched,
    }
}

// ---------------------------------------------------------------------------
// Main refresher loop
// ---------------------------------------------------------------------------

/// Run the weather refresher. This function never returns (runs until process exit).
///
/// Should be spawned via `tokio::spawn(run_weather_refresher(...))`. A
/// notification on `trigger` cuts the current sleep short.
pub async fn run_weather_refresher(
    pool: PgPool,
    catalog: Arc<dyn LocationCatalog>,
    cache: Arc<WeatherForecastCache>,
    source: Arc<dyn ForecastSource>,
    state: SharedRefresherState,
    trigger: Arc<Notify>,
) {
    let interval_secs = cache.config().refresh_interval_secs.max(1);
    tracing::info!("Weather refresher started (every {}s)", interval_secs);

    loop {
        let cycle_start = Utc::now();

        let locations = match catalog.list_locations().await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!("Weather refresher: failed to list locations: {}", e);
                sleep_or_trigger(REFRESH_ERROR_SLEEP_SECS, &trigger).await;
                continue;
            }
        };

        let refreshes = refresh_cycle(&cache, source.as_ref(), &locations, cycle_start).await;

        persist_fetched(&pool, &refreshes, cycle_start).await;
        prune_old_entries(&pool, &cache, cycle_start).await;

        let statuses: Vec<RegionRefreshStatus> = refreshes.into_iter().map(|r| r.status).collect();

        let fetched = statuses.iter().filter(|s| s.last_result == "fetched").count();
        let duration_ms = (Utc::now() - cycle_start).num_milliseconds().max(0) as u64;

        {
            let mut s = state.write().await;
            s.regions = statuses;
            s.next_wakeup_at = Some(Utc::now() + Duration::seconds(interval_secs as i64));
            s.last_cycle_completed_at = Some(Utc::now());
            s.last_cycle_duration_ms = Some(duration_ms);
            s.total_cycles += 1;
        }

        tracing::info!(
            "Weather refresher: cycle complete in {}ms, {} regions fetched, sleeping {}s",
            duration_ms,
            fetched,
            interval_secs
        );

        sleep_or_trigger(interval_secs, &trigger).await;
    }
}

/// Write the hours each region's fetch returned in this cycle.
async fn persist_fetched(pool: &PgPool, refreshes: &[RegionRefresh], fetched_at: DateTime<Utc>) {
    for refresh in refreshes.iter().filter(|r| !r.fetched.is_empty()) {
        let region = refresh.status.region_id;
        if let Err(e) =
            queries::upsert_weather_forecasts(pool, region, &refresh.fetched, fetched_at).await
        {
            tracing::warn!(
                "Weather refresher: failed to persist forecast for {}: {}",
                refresh.status.region,
                e
            );
        }
    }
}

async fn prune_old_entries(pool: &PgPool, cache: &WeatherForecastCache, now: DateTime<Utc>) {
    let cutoff = now - Duration::hours(FORECAST_RETENTION_HOURS);
    let dropped = cache.prune_before(cutoff).await;
    match queries::prune_weather_forecasts(pool, cutoff).await {
        Ok(rows) if rows > 0 || dropped > 0 => {
            tracing::debug!(
                "Weather refresher: pruned {} cached hours and {} stored rows before {}",
                dropped,
                rows,
                cutoff
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Weather refresher: failed to prune stored forecasts: {}", e),
    }
}

/// Sleep for `secs`, or until the refresh trigger fires.
async fn sleep_or_trigger(secs: u64, trigger: &Notify) {
    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_secs(secs)) => {}
        _ = trigger.notified() => {
            tracing::info!("Weather refresher: refresh requested, starting cycle early");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
