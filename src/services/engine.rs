//! Exposure engine: horizon gate plus near-field check over a rolling window.
//!
//! A regeneration run
//! 1. builds the instant grid and replaces the window in the store (destructive),
//! 2. partitions valid locations into batches sized by available parallelism,
//! 3. evaluates each batch on a dedicated rayon pool inside `spawn_blocking`,
//! 4. writes each batch with a single atomic upsert.
//!
//! Cancellation is checked before every batch launch; batches already in
//! flight finish and commit, so a cancelled run persists whole batches only.

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ComputationError;
use crate::helpers::floor_to_cadence;
use crate::services::exposure::Exposure;
use crate::services::horizon::{build_profile, HorizonParams, HorizonProfile};
use crate::services::near_field::{self, NearFieldParams, NoDataPolicy, Observer};
use crate::services::raster::{ElevationSampler, SharedSampler};
use crate::services::store::{ExposureRecord, ExposureStore, InstantRecord, Location, StoreError};
use crate::services::sun::SunPositionProvider;

/// Batches evaluated or awaiting their write at the same time.
const MAX_IN_FLIGHT_BATCHES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker pool error: {0}")]
    Worker(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ComputationError),
}

/// Immutable engine parameters, built once at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    /// Reference point for the sun positions of the instant grid.
    pub city_lat: f64,
    pub city_lon: f64,
    pub cadence_minutes: u32,
    pub window_hours: u32,
    pub retention_days: u32,
    /// Worker pool size.
    pub parallelism: usize,
    /// Overrides the parallelism heuristic when set.
    pub batch_size: Option<usize>,
    pub no_data_policy: NoDataPolicy,
    pub horizon: HorizonParams,
    pub near_field: NearFieldParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            city_lat: 47.0707,
            city_lon: 15.4395,
            cadence_minutes: 10,
            window_hours: 168,
            retention_days: 7,
            parallelism: num_cpus::get(),
            batch_size: None,
            no_data_policy: NoDataPolicy::Unknown,
            horizon: HorizonParams::default(),
            near_field: NearFieldParams::default(),
        }
    }
}

impl EngineConfig {
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size
            .filter(|&b| b > 0)
            .unwrap_or_else(|| batch_size_for_parallelism(self.parallelism))
    }

    pub fn cadence(&self) -> Duration {
        Duration::minutes(i64::from(self.cadence_minutes.max(1)))
    }

    pub fn window(&self) -> Duration {
        Duration::hours(i64::from(self.window_hours))
    }

    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }
}

/// Locations per batch for a given core count.
pub fn batch_size_for_parallelism(cores: usize) -> usize {
    match cores {
        c if c >= 8 => 25,
        c if c >= 4 => 15,
        _ => 10,
    }
}

/// Progress of the current (or last) run, shared with the status endpoint.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct EngineProgress {
    pub batches_total: usize,
    pub batches_done: usize,
    pub locations_total: usize,
    pub locations_done: usize,
    pub records_written: u64,
}

pub type SharedProgress = Arc<RwLock<EngineProgress>>;

/// Outcome of one regeneration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct RunSummary {
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub instants: usize,
    pub daytime_instants: usize,
    pub locations_skipped: usize,
    pub batches_total: usize,
    pub batches_done: usize,
    pub batches_failed: usize,
    pub records_written: u64,
    pub cancelled: bool,
}

/// Profiles after an ensure pass.
pub struct EnsuredProfiles {
    pub profiles: HashMap<Uuid, HorizonProfile>,
    /// Profiles that were (re)built and need persisting.
    pub rebuilt: Vec<(Uuid, HorizonProfile)>,
}

pub struct ExposureEngine {
    config: Arc<EngineConfig>,
    store: Arc<dyn ExposureStore>,
    terrain: SharedSampler,
    surface: SharedSampler,
    sun: Arc<dyn SunPositionProvider>,
    pool: Arc<rayon::ThreadPool>,
}

/// Everything a batch task needs, cheap to clone.
#[derive(Clone)]
struct BatchContext {
    config: Arc<EngineConfig>,
    store: Arc<dyn ExposureStore>,
    surface: SharedSampler,
    pool: Arc<rayon::ThreadPool>,
    instants: Arc<Vec<InstantRecord>>,
}

struct BatchOutcome {
    locations: usize,
    records: u64,
}

impl ExposureEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ExposureStore>,
        terrain: SharedSampler,
        surface: SharedSampler,
        sun: Arc<dyn SunPositionProvider>,
    ) -> Result<Self, EngineError> {
        config.horizon.bin_count()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallelism.max(1))
            .thread_name(|i| format!("exposure-worker-{}", i))
            .build()
            .map_err(|e| EngineError::Worker(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            store,
            terrain,
            surface,
            sun,
            pool: Arc::new(pool),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExposureStore> {
        &self.store
    }

    /// Instant grid for the window starting at `window_start` (floored to the
    /// cadence), with sun positions at the city reference point.
    pub fn time_grid(&self, window_start: DateTime<Utc>) -> Vec<InstantRecord> {
        let cadence = self.config.cadence();
        let start = floor_to_cadence(window_start, self.config.cadence_minutes);
        let count = self.config.window().num_minutes() / cadence.num_minutes();
        (0..count)
            .map(|k| {
                let ts = start + cadence * k as i32;
                InstantRecord {
                    ts,
                    sun: self
                        .sun
                        .position(ts, self.config.city_lat, self.config.city_lon),
                }
            })
            .collect()
    }

    /// Make sure every location has a profile built for its current observer
    /// height and the current terrain. Missing or stale profiles are rebuilt
    /// in parallel; malformed locations are skipped.
    pub async fn ensure_profiles(
        &self,
        locations: &[Location],
        mut existing: HashMap<Uuid, HorizonProfile>,
    ) -> Result<EnsuredProfiles, EngineError> {
        let fingerprint = self.terrain.fingerprint();
        let bin_width = self.config.horizon.bin_width_deg;
        let mut profiles = HashMap::with_capacity(locations.len());
        let mut to_build = Vec::new();

        for loc in locations {
            match existing.remove(&loc.id) {
                Some(p)
                    if p.is_current(loc.observer_height_m, &fingerprint)
                        && p.bin_width_deg() == bin_width =>
                {
                    profiles.insert(loc.id, p);
                }
                _ => to_build.push(loc.clone()),
            }
        }

        if to_build.is_empty() {
            return Ok(EnsuredProfiles {
                profiles,
                rebuilt: Vec::new(),
            });
        }

        tracing::info!(
            "Building {} horizon profiles ({} up to date)",
            to_build.len(),
            profiles.len()
        );

        let pool = self.pool.clone();
        let terrain = self.terrain.clone();
        let params = self.config.horizon.clone();
        let built: Vec<(Uuid, Result<HorizonProfile, ComputationError>)> =
            tokio::task::spawn_blocking(move || {
                pool.install(|| {
                    to_build
                        .par_iter()
                        .map(|loc| {
                            (
                                loc.id,
                                build_profile(
                                    terrain.as_ref(),
                                    loc.lat,
                                    loc.lon,
                                    loc.observer_height_m,
                                    &params,
                                ),
                            )
                        })
                        .collect()
                })
            })
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        let mut rebuilt = Vec::with_capacity(built.len());
        for (id, result) in built {
            match result {
                Ok(profile) => {
                    profiles.insert(id, profile.clone());
                    rebuilt.push((id, profile));
                }
                Err(e) => tracing::warn!("Skipping horizon profile for {}: {}", id, e),
            }
        }
        rebuilt.sort_by_key(|(id, _)| *id);

        Ok(EnsuredProfiles { profiles, rebuilt })
    }

    /// Destructively rebuild the window starting at `window_start`.
    pub async fn regenerate(
        &self,
        locations: Vec<Location>,
        profiles: &HashMap<Uuid, HorizonProfile>,
        window_start: DateTime<Utc>,
        cancel: &CancellationToken,
        progress: &SharedProgress,
    ) -> Result<RunSummary, EngineError> {
        let grid = self.time_grid(window_start);
        let start = floor_to_cadence(window_start, self.config.cadence_minutes);
        let end = start + self.config.window();

        self.store.replace_window(start, end, &grid).await?;

        let daytime: Vec<InstantRecord> = grid.iter().filter(|i| i.sun.is_up()).copied().collect();

        let mut work: Vec<(Location, HorizonProfile)> = Vec::with_capacity(locations.len());
        let mut skipped = 0usize;
        for loc in locations {
            match validate_location(&loc, profiles) {
                Ok(profile) => {
                    let profile = profile.clone();
                    work.push((loc, profile));
                }
                Err(e) => {
                    tracing::warn!("Skipping location {}: {}", loc.id, e);
                    skipped += 1;
                }
            }
        }
        work.sort_by_key(|(loc, _)| loc.id);

        let batch_size = self.config.effective_batch_size();
        let mut batches: Vec<Vec<(Location, HorizonProfile)>> = Vec::new();
        let mut iter = work.into_iter().peekable();
        while iter.peek().is_some() {
            batches.push(iter.by_ref().take(batch_size).collect());
        }

        let mut summary = RunSummary {
            window_start: Some(start),
            window_end: Some(end),
            instants: grid.len(),
            daytime_instants: daytime.len(),
            locations_skipped: skipped,
            batches_total: batches.len(),
            ..RunSummary::default()
        };

        {
            let mut p = progress.write().await;
            *p = EngineProgress {
                batches_total: batches.len(),
                locations_total: batches.iter().map(Vec::len).sum(),
                ..EngineProgress::default()
            };
        }

        tracing::info!(
            "Regenerating window {} .. {}: {} instants ({} daytime), {} batches of up to {} locations",
            start,
            end,
            grid.len(),
            daytime.len(),
            batches.len(),
            batch_size
        );

        let ctx = BatchContext {
            config: self.config.clone(),
            store: self.store.clone(),
            surface: self.surface.clone(),
            pool: self.pool.clone(),
            instants: Arc::new(daytime),
        };

        let mut pending = batches.into_iter();
        let mut join_set = JoinSet::new();
        let mut halted = false;

        loop {
            while !halted && join_set.len() < MAX_IN_FLIGHT_BATCHES {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break;
                }
                let Some(batch) = pending.next() else { break };
                join_set.spawn(run_batch(ctx.clone(), batch));
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(outcome)) => {
                    summary.batches_done += 1;
                    summary.records_written += outcome.records;
                    let mut p = progress.write().await;
                    p.batches_done += 1;
                    p.locations_done += outcome.locations;
                    p.records_written += outcome.records;
                }
                Ok(Err(e)) => {
                    tracing::error!("Exposure batch failed: {}", e);
                    summary.batches_failed += 1;
                    halted = true;
                }
                Err(e) => {
                    tracing::error!("Exposure batch task panicked or was aborted: {}", e);
                    summary.batches_failed += 1;
                    halted = true;
                }
            }
        }

        if summary.cancelled {
            tracing::warn!(
                "Regeneration cancelled after {}/{} batches",
                summary.batches_done,
                summary.batches_total
            );
        }

        Ok(summary)
    }
}

async fn run_batch(
    ctx: BatchContext,
    batch: Vec<(Location, HorizonProfile)>,
) -> Result<BatchOutcome, EngineError> {
    let locations = batch.len();
    let pool = ctx.pool.clone();
    let config = ctx.config.clone();
    let surface = ctx.surface.clone();
    let instants = ctx.instants.clone();

    let mut records: Vec<ExposureRecord> = tokio::task::spawn_blocking(move || {
        pool.install(|| {
            batch
                .par_iter()
                .flat_map_iter(|(loc, profile)| {
                    evaluate_location(loc, profile, &instants, surface.as_ref(), &config)
                })
                .collect()
        })
    })
    .await
    .map_err(|e| EngineError::Worker(e.to_string()))?;

    records.sort_by_key(|r| (r.location_id, r.ts));
    let written = ctx.store.upsert_records(&records).await?;

    Ok(BatchOutcome {
        locations,
        records: written,
    })
}

/// Profile for `loc`, or the reason it cannot be processed.
fn validate_location<'a>(
    loc: &Location,
    profiles: &'a HashMap<Uuid, HorizonProfile>,
) -> Result<&'a HorizonProfile, ComputationError> {
    let finite = loc.lat.is_finite() && loc.lon.is_finite() && loc.observer_height_m.is_finite();
    if !finite || loc.lat.abs() > 90.0 || loc.lon.abs() > 180.0 {
        return Err(ComputationError::MalformedLocation(format!(
            "coordinates ({}, {}) height {}",
            loc.lat, loc.lon, loc.observer_height_m
        )));
    }
    profiles
        .get(&loc.id)
        .ok_or(ComputationError::MissingProfile(loc.id))
}

/// Exposure of one location at every daytime instant.
///
/// The horizon gate decides first; the near-field evaluator only runs when
/// the sun clears the interpolated terrain angle.
pub fn evaluate_location(
    loc: &Location,
    profile: &HorizonProfile,
    instants: &[InstantRecord],
    surface: &dyn ElevationSampler,
    config: &EngineConfig,
) -> Vec<ExposureRecord> {
    let observer = Observer {
        lat: loc.lat,
        lon: loc.lon,
        height_m: loc.observer_height_m,
    };

    instants
        .iter()
        .filter(|i| i.sun.is_up())
        .map(|instant| {
            let sun = instant.sun;
            let exposure = if !sun.azimuth_deg.is_finite() || !sun.elevation_deg.is_finite() {
                Exposure::Unknown
            } else {
                let gate = profile.gate_at(sun.azimuth_deg);
                if sun.elevation_deg <= gate.angle_deg {
                    Exposure::Shaded
                } else {
                    let near = near_field::evaluate(
                        surface,
                        observer,
                        sun,
                        &config.near_field,
                        config.no_data_policy,
                    );
                    if near == Exposure::Exposed
                        && gate.low_confidence
                        && config.no_data_policy == NoDataPolicy::Unknown
                    {
                        Exposure::Unknown
                    } else {
                        near
                    }
                }
            };
            ExposureRecord {
                location_id: loc.id,
                ts: instant.ts,
                exposure,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::raster::testing::{flat, CountingSampler};
    use crate::services::raster::NoCoverage;
    use crate::services::store::testing::MemoryExposureStore;
    use crate::services::sun::{NoaaSunPosition, SunPosition};
    use async_trait::async_trait;

    const OBSERVER_HEIGHT: f64 = 354.4;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse::<DateTime<Utc>>().unwrap()
    }

    fn location(i: u128) -> Location {
        Location {
            id: Uuid::from_u128(i + 1),
            osm_id: Some(i as i64),
            name: None,
            lat: 47.07 + (i as f64) * 0.0005,
            lon: 15.44,
            ground_elevation_m: OBSERVER_HEIGHT - 1.2,
            observer_height_m: OBSERVER_HEIGHT,
        }
    }

    fn example_profile() -> HorizonProfile {
        let mut angles = vec![0.0; 180];
        angles[89] = 5.0;
        angles[90] = 6.0;
        HorizonProfile::from_parts(2.0, angles, vec![false; 180], "fn".into(), OBSERVER_HEIGHT)
            .unwrap()
    }

    fn instant(az: f64, el: f64) -> InstantRecord {
        InstantRecord {
            ts: utc("2024-06-21T11:00:00Z"),
            sun: SunPosition {
                azimuth_deg: az,
                elevation_deg: el,
            },
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            parallelism: 2,
            window_hours: 24,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_batch_size_heuristic() {
        assert_eq!(batch_size_for_parallelism(16), 25);
        assert_eq!(batch_size_for_parallelism(8), 25);
        assert_eq!(batch_size_for_parallelism(7), 15);
        assert_eq!(batch_size_for_parallelism(4), 15);
        assert_eq!(batch_size_for_parallelism(3), 10);
        assert_eq!(batch_size_for_parallelism(1), 10);
        assert_eq!(batch_size_for_parallelism(0), 10);
    }

    #[test]
    fn test_configured_batch_size_overrides_heuristic() {
        let config = EngineConfig {
            parallelism: 16,
            batch_size: Some(3),
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_batch_size(), 3);
        let config = EngineConfig {
            parallelism: 16,
            batch_size: None,
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_batch_size(), 25);
    }

    #[test]
    fn test_gate_passes_and_near_field_runs() {
        // Sun 180°/40° against a 5.5° gate: near field decides
        let surface = CountingSampler::new(flat(OBSERVER_HEIGHT - 1.2));
        let records = evaluate_location(
            &location(0),
            &example_profile(),
            &[instant(180.0, 40.0)],
            &surface,
            &test_config(),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].exposure, Exposure::Exposed);
        assert!(surface.count() > 0);
    }

    #[test]
    fn test_gate_blocks_without_near_field() {
        // Sun 180°/3° is below the 5.5° gate
        let surface = CountingSampler::new(flat(OBSERVER_HEIGHT - 1.2));
        let records = evaluate_location(
            &location(0),
            &example_profile(),
            &[instant(180.0, 3.0)],
            &surface,
            &test_config(),
        );
        assert_eq!(records[0].exposure, Exposure::Shaded);
        assert_eq!(surface.count(), 0);
    }

    #[test]
    fn test_elevation_equal_to_gate_is_shaded() {
        let surface = CountingSampler::new(flat(0.0));
        let records = evaluate_location(
            &location(0),
            &example_profile(),
            &[instant(180.0, 5.5)],
            &surface,
            &test_config(),
        );
        assert_eq!(records[0].exposure, Exposure::Shaded);
        assert_eq!(surface.count(), 0);
    }

    #[test]
    fn test_night_instants_produce_no_records_and_no_samples() {
        let surface = CountingSampler::new(flat(0.0));
        let records = evaluate_location(
            &location(0),
            &example_profile(),
            &[instant(0.0, -20.0), instant(90.0, 0.0)],
            &surface,
            &test_config(),
        );
        assert!(records.is_empty());
        assert_eq!(surface.count(), 0);
    }

    #[test]
    fn test_low_confidence_gate_downgrades_exposed_to_unknown() {
        let profile = HorizonProfile::from_parts(
            2.0,
            vec![0.0; 180],
            vec![true; 180],
            "fn".into(),
            OBSERVER_HEIGHT,
        )
        .unwrap();
        let surface = flat(0.0);
        let records = evaluate_location(
            &location(0),
            &profile,
            &[instant(180.0, 40.0)],
            &surface,
            &test_config(),
        );
        assert_eq!(records[0].exposure, Exposure::Unknown);

        let optimistic = EngineConfig {
            no_data_policy: NoDataPolicy::Optimistic,
            ..test_config()
        };
        let records = evaluate_location(
            &location(0),
            &profile,
            &[instant(180.0, 40.0)],
            &surface,
            &optimistic,
        );
        assert_eq!(records[0].exposure, Exposure::Exposed);
    }

    #[test]
    fn test_missing_sun_data_is_unknown() {
        let records = evaluate_location(
            &location(0),
            &example_profile(),
            &[InstantRecord {
                ts: utc("2024-06-21T11:00:00Z"),
                sun: SunPosition {
                    azimuth_deg: f64::NAN,
                    elevation_deg: 30.0,
                },
            }],
            &flat(0.0),
            &test_config(),
        );
        assert_eq!(records[0].exposure, Exposure::Unknown);
    }

    fn engine_with(store: Arc<dyn ExposureStore>, config: EngineConfig) -> ExposureEngine {
        ExposureEngine::new(
            config,
            store,
            Arc::new(flat(OBSERVER_HEIGHT - 1.2)),
            Arc::new(flat(OBSERVER_HEIGHT - 1.2)),
            Arc::new(NoaaSunPosition),
        )
        .unwrap()
    }

    async fn profiles_for(engine: &ExposureEngine, locs: &[Location]) -> HashMap<Uuid, HorizonProfile> {
        engine
            .ensure_profiles(locs, HashMap::new())
            .await
            .unwrap()
            .profiles
    }

    #[test]
    fn test_time_grid_is_floored_and_complete() {
        let engine = engine_with(Arc::new(MemoryExposureStore::new()), test_config());
        let grid = engine.time_grid(utc("2024-06-21T10:07:31Z"));
        assert_eq!(grid.len(), 144);
        assert_eq!(grid[0].ts, utc("2024-06-21T10:00:00Z"));
        assert_eq!(grid[1].ts, utc("2024-06-21T10:10:00Z"));
        assert!(grid.iter().any(|i| i.sun.is_up()));
        assert!(grid.iter().any(|i| !i.sun.is_up()));
    }

    #[tokio::test]
    async fn test_ensure_profiles_rebuilds_only_stale() {
        let engine = engine_with(Arc::new(MemoryExposureStore::new()), test_config());
        let locs = vec![location(0), location(1)];
        let first = engine.ensure_profiles(&locs, HashMap::new()).await.unwrap();
        assert_eq!(first.rebuilt.len(), 2);
        assert_eq!(first.profiles.len(), 2);

        let second = engine
            .ensure_profiles(&locs, first.profiles.clone())
            .await
            .unwrap();
        assert!(second.rebuilt.is_empty());

        // Observer height changed for one location
        let mut moved = locs.clone();
        moved[1].observer_height_m += 2.0;
        let third = engine.ensure_profiles(&moved, first.profiles).await.unwrap();
        assert_eq!(third.rebuilt.len(), 1);
        assert_eq!(third.rebuilt[0].0, moved[1].id);
    }

    #[tokio::test]
    async fn test_regeneration_is_deterministic() {
        let locs: Vec<Location> = (0..7).map(location).collect();
        let start = utc("2024-06-21T00:00:00Z");

        let store_a = Arc::new(MemoryExposureStore::new());
        let engine_a = engine_with(store_a.clone(), test_config());
        let profiles = profiles_for(&engine_a, &locs).await;
        let progress = SharedProgress::default();
        engine_a
            .regenerate(locs.clone(), &profiles, start, &CancellationToken::new(), &progress)
            .await
            .unwrap();

        let store_b = Arc::new(MemoryExposureStore::new());
        let engine_b = engine_with(
            store_b.clone(),
            EngineConfig {
                batch_size: Some(2),
                ..test_config()
            },
        );
        engine_b
            .regenerate(locs.clone(), &profiles, start, &CancellationToken::new(), &progress)
            .await
            .unwrap();

        let a = store_a.all_records().await;
        assert!(!a.is_empty());
        assert_eq!(a, store_b.all_records().await);

        // Re-running into the same store replaces rather than accumulates
        engine_a
            .regenerate(locs, &profiles, start, &CancellationToken::new(), &progress)
            .await
            .unwrap();
        assert_eq!(a, store_a.all_records().await);
    }

    #[tokio::test]
    async fn test_regeneration_reports_progress_and_skips_malformed() {
        let mut locs: Vec<Location> = (0..5).map(location).collect();
        let store = Arc::new(MemoryExposureStore::new());
        let engine = engine_with(
            store.clone(),
            EngineConfig {
                batch_size: Some(2),
                ..test_config()
            },
        );
        let profiles = profiles_for(&engine, &locs).await;
        locs[4].lat = f64::NAN;
        let mut no_profile = location(99);
        no_profile.id = Uuid::from_u128(999);
        locs.push(no_profile);

        let progress = SharedProgress::default();
        let summary = engine
            .regenerate(
                locs,
                &profiles,
                utc("2024-06-21T00:00:00Z"),
                &CancellationToken::new(),
                &progress,
            )
            .await
            .unwrap();

        assert_eq!(summary.locations_skipped, 2);
        assert_eq!(summary.batches_total, 2);
        assert_eq!(summary.batches_done, 2);
        assert!(!summary.cancelled);
        let p = progress.read().await;
        assert_eq!(p.locations_done, 4);
        assert_eq!(p.records_written, summary.records_written);
        assert_eq!(
            summary.records_written,
            (4 * summary.daytime_instants) as u64
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_no_batches() {
        let locs: Vec<Location> = (0..3).map(location).collect();
        let store = Arc::new(MemoryExposureStore::new());
        let engine = engine_with(store.clone(), test_config());
        let profiles = profiles_for(&engine, &locs).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = engine
            .regenerate(
                locs,
                &profiles,
                utc("2024-06-21T00:00:00Z"),
                &cancel,
                &SharedProgress::default(),
            )
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.batches_done, 0);
        assert!(store.all_records().await.is_empty());
    }

    /// Cancels the run as soon as the first batch commits.
    struct CancelOnFirstWrite {
        inner: MemoryExposureStore,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl ExposureStore for CancelOnFirstWrite {
        async fn replace_window(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            instants: &[InstantRecord],
        ) -> Result<(), StoreError> {
            self.inner.replace_window(from, to, instants).await
        }
        async fn upsert_records(&self, records: &[ExposureRecord]) -> Result<u64, StoreError> {
            let n = self.inner.upsert_records(records).await?;
            self.cancel.cancel();
            Ok(n)
        }
        async fn records_for_location(
            &self,
            id: Uuid,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<ExposureRecord>, StoreError> {
            self.inner.records_for_location(id, from, to).await
        }
        async fn records_for_locations(
            &self,
            ids: &[Uuid],
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<ExposureRecord>, StoreError> {
            self.inner.records_for_locations(ids, from, to).await
        }
        async fn records_for_instant(
            &self,
            ts: DateTime<Utc>,
            ids: Option<&[Uuid]>,
        ) -> Result<Vec<ExposureRecord>, StoreError> {
            self.inner.records_for_instant(ts, ids).await
        }
        async fn sun_position_at(
            &self,
            ts: DateTime<Utc>,
        ) -> Result<Option<SunPosition>, StoreError> {
            self.inner.sun_position_at(ts).await
        }
        async fn instants_between(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<InstantRecord>, StoreError> {
            self.inner.instants_between(from, to).await
        }
        async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.prune_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_persists_whole_batches_only() {
        let locs: Vec<Location> = (0..12).map(location).collect();
        let cancel = CancellationToken::new();
        let store = Arc::new(CancelOnFirstWrite {
            inner: MemoryExposureStore::new(),
            cancel: cancel.clone(),
        });
        let engine = engine_with(
            store.clone(),
            EngineConfig {
                batch_size: Some(1),
                ..test_config()
            },
        );
        let profiles = profiles_for(&engine, &locs).await;

        let summary = engine
            .regenerate(
                locs.clone(),
                &profiles,
                utc("2024-06-21T00:00:00Z"),
                &cancel,
                &SharedProgress::default(),
            )
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(summary.batches_done >= 1);
        assert!(summary.batches_done <= MAX_IN_FLIGHT_BATCHES);
        assert!(summary.batches_done < summary.batches_total);

        let records = store.inner.all_records().await;
        for loc in &locs {
            let n = records.iter().filter(|r| r.location_id == loc.id).count();
            assert!(
                n == 0 || n == summary.daytime_instants,
                "location {} has a partial batch ({} records)",
                loc.id,
                n
            );
        }
    }

    #[tokio::test]
    async fn test_missing_surface_data_yields_unknown_records() {
        let locs = vec![location(0)];
        let store = Arc::new(MemoryExposureStore::new());
        let engine = ExposureEngine::new(
            test_config(),
            store.clone(),
            Arc::new(flat(0.0)),
            Arc::new(NoCoverage),
            Arc::new(NoaaSunPosition),
        )
        .unwrap();
        let profiles = profiles_for(&engine, &locs).await;
        engine
            .regenerate(
                locs,
                &profiles,
                utc("2024-06-21T00:00:00Z"),
                &CancellationToken::new(),
                &SharedProgress::default(),
            )
            .await
            .unwrap();
        let records = store.all_records().await;
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.exposure == Exposure::Unknown));
    }
}
