//! Region-bucketed cloud-cover forecast cache.
//!
//! Nearby locations share one forecast per region, so a city of benches costs
//! a handful of upstream fetches per refresh. Lookups never fail: a region
//! that could not be refreshed keeps serving its last forecast with a
//! staleness flag, and a region with no data at all reports Unavailable.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use crate::errors::AppError;
use crate::helpers::floor_to_hour;
use crate::services::exposure::{Exposure, NextInstant};

/// Coarse spatial bucket: floor(lat/cell) in the high 32 bits, floor(lon/cell)
/// in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct RegionId(pub i64);

impl RegionId {
    pub fn for_point(lat: f64, lon: f64, cell_deg: f64) -> RegionId {
        let lat_idx = (lat / cell_deg).floor() as i32;
        let lon_idx = (lon / cell_deg).floor() as i32;
        RegionId((i64::from(lat_idx) << 32) | i64::from(lon_idx as u32))
    }

    pub fn indices(self) -> (i32, i32) {
        ((self.0 >> 32) as i32, self.0 as i32)
    }

    /// Centre of the region cell; forecasts are fetched here.
    pub fn center(self, cell_deg: f64) -> (f64, f64) {
        let (lat_idx, lon_idx) = self.indices();
        (
            (f64::from(lat_idx) + 0.5) * cell_deg,
            (f64::from(lon_idx) + 0.5) * cell_deg,
        )
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (lat_idx, lon_idx) = self.indices();
        write!(f, "region_{}_{}", lat_idx, lon_idx)
    }
}

/// One hourly forecast value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastHour {
    pub hour: DateTime<Utc>,
    pub cloud_cover_pct: f64,
    pub sunshine_seconds: Option<f64>,
}

/// Treatment of an hour the cached forecast does not cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingForecastPolicy {
    #[default]
    Unknown,
    Sunny,
}

impl FromStr for MissingForecastPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(MissingForecastPolicy::Unknown),
            "sunny" => Ok(MissingForecastPolicy::Sunny),
            other => Err(format!("unknown missing-forecast policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherConfig {
    pub api_url: String,
    pub timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub ttl_secs: u64,
    pub horizon_hours: u32,
    pub cloud_cover_threshold_pct: f64,
    pub missing_policy: MissingForecastPolicy,
    pub region_cell_deg: f64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.open-meteo.com/v1/forecast".to_string(),
            timeout_secs: 30,
            refresh_interval_secs: 300,
            // Two refresh intervals: one missed cycle is tolerated
            ttl_secs: 600,
            horizon_hours: 168,
            cloud_cover_threshold_pct: 20.0,
            missing_policy: MissingForecastPolicy::Unknown,
            region_cell_deg: 0.1,
        }
    }
}

/// Upstream hourly forecast provider. Unreliable by contract.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch_forecast(&self, lat: f64, lon: f64) -> Result<Vec<ForecastHour>, AppError>;
}

/// Raw cache answer for one region and hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkyLookup {
    Sunny { stale: bool },
    Cloudy { stale: bool },
    /// The region is cached but the hour is not covered.
    Missing { stale: bool },
    /// Nothing cached for the region.
    Unavailable,
}

/// Sky state as an exposure factor: clouds shade, unknown stays unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkyVerdict {
    pub sky: Exposure,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The hours returned by the fetch, hour-aligned.
    Fetched { hours: Vec<ForecastHour> },
    /// Fetch failed; the previous forecast keeps being served as stale.
    FailedServingStale(String),
    /// Fetch failed and nothing is cached.
    FailedNoData(String),
}

#[derive(Debug, Clone)]
struct RegionForecast {
    hours: BTreeMap<DateTime<Utc>, ForecastHour>,
    fetched_at: DateTime<Utc>,
    last_refresh_failed: bool,
}

/// Per-region cache summary for the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RegionSummary {
    pub region_id: RegionId,
    pub region: String,
    pub hours: usize,
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
}

/// Cached hours of one region over a time range.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastWindow {
    pub hours: Vec<ForecastHour>,
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
}

pub struct WeatherForecastCache {
    config: WeatherConfig,
    regions: RwLock<HashMap<RegionId, RegionForecast>>,
}

impl WeatherForecastCache {
    pub fn new(config: WeatherConfig) -> Self {
        Self {
            config,
            regions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WeatherConfig {
        &self.config
    }

    pub fn region_for(&self, lat: f64, lon: f64) -> RegionId {
        RegionId::for_point(lat, lon, self.config.region_cell_deg)
    }

    fn is_stale(&self, forecast: &RegionForecast, now: DateTime<Utc>) -> bool {
        forecast.last_refresh_failed
            || now - forecast.fetched_at > Duration::seconds(self.config.ttl_secs as i64)
    }

    /// Clear sky: cloud cover below the threshold.
    pub fn is_sunny(&self, hour: &ForecastHour) -> bool {
        hour.cloud_cover_pct < self.config.cloud_cover_threshold_pct
    }

    /// Fetch the region's forecast and merge it into the cache. On failure the
    /// cached values stay in place.
    pub async fn refresh_region(
        &self,
        source: &dyn ForecastSource,
        region: RegionId,
        now: DateTime<Utc>,
    ) -> RefreshOutcome {
        let (lat, lon) = region.center(self.config.region_cell_deg);
        match source.fetch_forecast(lat, lon).await {
            Ok(hours) => {
                let hours: Vec<ForecastHour> = hours
                    .into_iter()
                    .map(|h| ForecastHour {
                        hour: floor_to_hour(h.hour),
                        ..h
                    })
                    .collect();
                let mut regions = self.regions.write().await;
                let entry = regions.entry(region).or_insert_with(|| RegionForecast {
                    hours: BTreeMap::new(),
                    fetched_at: now,
                    last_refresh_failed: false,
                });
                for h in &hours {
                    entry.hours.insert(h.hour, *h);
                }
                entry.fetched_at = now;
                entry.last_refresh_failed = false;
                RefreshOutcome::Fetched { hours }
            }
            Err(e) => {
                let mut regions = self.regions.write().await;
                match regions.get_mut(&region) {
                    Some(cached) => {
                        tracing::warn!(
                            "Forecast refresh for {} failed, serving stale data: {}",
                            region,
                            e
                        );
                        cached.last_refresh_failed = true;
                        RefreshOutcome::FailedServingStale(e.to_string())
                    }
                    None => {
                        tracing::warn!(
                            "Forecast refresh for {} failed and no cached data exists: {}",
                            region,
                            e
                        );
                        RefreshOutcome::FailedNoData(e.to_string())
                    }
                }
            }
        }
    }

    /// Seed a region from persisted entries (startup warm-up).
    pub async fn seed(&self, region: RegionId, hours: Vec<ForecastHour>, fetched_at: DateTime<Utc>) {
        let mut regions = self.regions.write().await;
        let entry = regions.entry(region).or_insert_with(|| RegionForecast {
            hours: BTreeMap::new(),
            fetched_at,
            last_refresh_failed: false,
        });
        for h in hours {
            entry.hours.insert(floor_to_hour(h.hour), h);
        }
        if fetched_at > entry.fetched_at {
            entry.fetched_at = fetched_at;
        }
    }

    /// Cached hours of a region in `[from, to)`. `None` if nothing is cached
    /// for the region.
    pub async fn forecast_window(
        &self,
        region: RegionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<ForecastWindow> {
        let regions = self.regions.read().await;
        let forecast = regions.get(&region)?;
        let start = floor_to_hour(from);
        let hours = if start < to {
            forecast.hours.range(start..to).map(|(_, h)| *h).collect()
        } else {
            Vec::new()
        };
        Some(ForecastWindow {
            hours,
            fetched_at: forecast.fetched_at,
            stale: self.is_stale(forecast, now),
        })
    }


    pub async fn lookup(&self, region: RegionId, at: DateTime<Utc>, now: DateTime<Utc>) -> SkyLookup {
        let regions = self.regions.read().await;
        let Some(forecast) = regions.get(&region) else {
            return SkyLookup::Unavailable;
        };
        let stale = self.is_stale(forecast, now);
        match forecast.hours.get(&floor_to_hour(at)) {
            Some(h) if self.is_sunny(h) => SkyLookup::Sunny { stale },
            Some(_) => SkyLookup::Cloudy { stale },
            None => SkyLookup::Missing { stale },
        }
    }

    /// Sky factor for `at`, with the missing-hour policy applied.
    pub async fn sky_at(&self, region: RegionId, at: DateTime<Utc>, now: DateTime<Utc>) -> SkyVerdict {
        match self.lookup(region, at, now).await {
            SkyLookup::Sunny { stale } => SkyVerdict {
                sky: Exposure::Exposed,
                stale,
            },
            SkyLookup::Cloudy { stale } => SkyVerdict {
                sky: Exposure::Shaded,
                stale,
            },
            SkyLookup::Missing { stale } => SkyVerdict {
                sky: match self.config.missing_policy {
                    MissingForecastPolicy::Unknown => Exposure::Unknown,
                    MissingForecastPolicy::Sunny => Exposure::Exposed,
                },
                stale,
            },
            SkyLookup::Unavailable => SkyVerdict {
                sky: Exposure::Unknown,
                stale: false,
            },
        }
    }

    /// First hour in `[from, to)` (hour-floored start) with a clear sky,
    /// counting uncovered hours as sunny under the sunny-by-default policy.
    /// Uncovered hours make a miss `Unknown`; so does an uncached region.
    pub async fn next_sunny_hour(
        &self,
        region: RegionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> NextInstant {
        let regions = self.regions.read().await;
        let Some(forecast) = regions.get(&region) else {
            return NextInstant::Unknown;
        };
        let mut uncovered = false;
        let mut hour = floor_to_hour(from);
        while hour < to {
            match forecast.hours.get(&hour) {
                Some(h) if self.is_sunny(h) => return NextInstant::Found(hour),
                Some(_) => {}
                None if self.config.missing_policy == MissingForecastPolicy::Sunny => {
                    return NextInstant::Found(hour)
                }
                None => uncovered = true,
            }
            hour += Duration::hours(1);
        }
        if uncovered {
            NextInstant::Unknown
        } else {
            NextInstant::NoneWithinHorizon
        }
    }

    /// First hour in `[from, to)` (hour-floored start) that is not cached as
    /// cloudy. `None` means every hour of the range is known to be overcast.
    pub async fn first_uncloudy_hour(
        &self,
        region: RegionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let start = floor_to_hour(from);
        let regions = self.regions.read().await;
        let Some(forecast) = regions.get(&region) else {
            return Some(start);
        };
        let mut hour = start;
        while hour < to {
            match forecast.hours.get(&hour) {
                Some(h) if !self.is_sunny(h) => hour += Duration::hours(1),
                _ => return Some(hour),
            }
        }
        None
    }

    /// Drop hours before `cutoff`; regions left empty are removed.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut regions = self.regions.write().await;
        let mut removed = 0;
        for forecast in regions.values_mut() {
            let kept = forecast.hours.split_off(&cutoff);
            removed += forecast.hours.len();
            forecast.hours = kept;
        }
        regions.retain(|_, f| !f.hours.is_empty());
        removed
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> Vec<RegionSummary> {
        let regions = self.regions.read().await;
        let mut out: Vec<RegionSummary> = regions
            .iter()
            .map(|(id, f)| RegionSummary {
                region_id: *id,
                region: id.to_string(),
                hours: f.hours.len(),
                fetched_at: f.fetched_at,
                stale: self.is_stale(f, now),
            })
            .collect();
        out.sort_by_key(|r| r.region_id);
        out
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted forecast source: serves `hours` or fails when `fail` is set.
    pub struct StubSource {
        pub hours: Mutex<Vec<ForecastHour>>,
        pub fail: std::sync::atomic::AtomicBool,
        pub calls: AtomicUsize,
    }

    impl StubSource {
        pub fn new(hours: Vec<ForecastHour>) -> Self {
            Self {
                hours: Mutex::new(hours),
                fail: std::sync::atomic::AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ForecastSource for StubSource {
        async fn fetch_forecast(&self, _lat: f64, _lon: f64) -> Result<Vec<ForecastHour>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::ExternalServiceError("timeout".to_string()));
            }
            Ok(self.hours.lock().unwrap().clone())
        }
    }

    /// Consecutive hours from `start` with the given cloud cover values.
    pub fn hours_from(start: DateTime<Utc>, cloud: &[f64]) -> Vec<ForecastHour> {
        cloud
            .iter()
            .enumerate()
            .map(|(i, c)| ForecastHour {
                hour: start + Duration::hours(i as i64),
                cloud_cover_pct: *c,
                sunshine_seconds: Some(if *c < 20.0 { 3600.0 } else { 0.0 }),
            })
            .collect()
    }
}
