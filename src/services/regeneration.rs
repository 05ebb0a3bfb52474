//! Regeneration lifecycle: one run at a time, cancellable, on a schedule.
//!
//! A run ensures horizon profiles, persists the rebuilt ones, destructively
//! regenerates the window from "now" and finally prunes records older than
//! the retention period.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::errors::AppError;
use crate::helpers::floor_to_cadence;
use crate::services::engine::{EngineProgress, ExposureEngine, RunSummary, SharedProgress};
use crate::services::store::LocationCatalog;

/// Regeneration status, exposed via the status endpoint.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct RegenerationState {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub profiles_rebuilt: usize,
    pub records_pruned: u64,
    pub last_summary: Option<RunSummary>,
    pub last_error: Option<String>,
    /// Live progress of the current run (or the final counts of the last one).
    pub progress: EngineProgress,
}

pub type SharedRegenerationState = Arc<RwLock<RegenerationState>>;

pub struct RegenerationService {
    engine: Arc<ExposureEngine>,
    catalog: Arc<dyn LocationCatalog>,
    state: SharedRegenerationState,
    progress: SharedProgress,
    active: Mutex<Option<CancellationToken>>,
}

impl RegenerationService {
    pub fn new(engine: Arc<ExposureEngine>, catalog: Arc<dyn LocationCatalog>) -> Self {
        Self {
            engine,
            catalog,
            state: Arc::new(RwLock::new(RegenerationState::default())),
            progress: Arc::new(RwLock::new(EngineProgress::default())),
            active: Mutex::new(None),
        }
    }

    /// Current state with live progress merged in.
    pub async fn status(&self) -> RegenerationState {
        let mut state = self.state.read().await.clone();
        state.progress = self.progress.read().await.clone();
        state
    }

    async fn claim(&self) -> Result<CancellationToken, AppError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(AppError::Conflict(
                "A regeneration is already running".to_string(),
            ));
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Ok(token)
    }

    /// Request cancellation of the running regeneration. Returns false when
    /// nothing is running.
    pub async fn cancel(&self) -> bool {
        match self.active.lock().await.as_ref() {
            Some(token) => {
                tracing::info!("Regeneration cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Start a regeneration in the background. Fails with `Conflict` while
    /// another run is active.
    pub async fn trigger(self: &Arc<Self>) -> Result<(), AppError> {
        let token = self.claim().await?;
        let service = self.clone();
        tokio::spawn(async move {
            let _ = service.run_claimed(Utc::now(), token).await;
        });
        Ok(())
    }

    /// Run a regeneration to completion on the current task.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunSummary, AppError> {
        let token = self.claim().await?;
        self.run_claimed(now, token).await
    }

    async fn run_claimed(
        &self,
        now: DateTime<Utc>,
        token: CancellationToken,
    ) -> Result<RunSummary, AppError> {
        {
            let mut s = self.state.write().await;
            s.running = true;
            s.started_at = Some(Utc::now());
            s.last_error = None;
        }

        let result = self.execute(now, &token).await;

        *self.active.lock().await = None;

        let mut s = self.state.write().await;
        s.running = false;
        s.finished_at = Some(Utc::now());
        s.total_runs += 1;
        match &result {
            Ok(summary) => {
                tracing::info!(
                    "Regeneration finished: {}/{} batches, {} records, {} skipped locations{}",
                    summary.batches_done,
                    summary.batches_total,
                    summary.records_written,
                    summary.locations_skipped,
                    if summary.cancelled { " (cancelled)" } else { "" }
                );
                if summary.batches_failed > 0 {
                    let message = format!(
                        "{} of {} batches failed to persist",
                        summary.batches_failed, summary.batches_total
                    );
                    tracing::error!("Regeneration incomplete: {}", message);
                    s.last_error = Some(message);
                }
                s.last_summary = Some(summary.clone());
            }
            Err(e) => {
                tracing::error!("Regeneration failed: {}", e);
                s.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn execute(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<RunSummary, AppError> {
        let locations = self.catalog.list_locations().await?;
        let existing = self.catalog.load_profiles().await?;

        let ensured = self.engine.ensure_profiles(&locations, existing).await?;
        if !ensured.rebuilt.is_empty() {
            self.catalog.save_profiles(&ensured.rebuilt).await?;
        }
        self.state.write().await.profiles_rebuilt = ensured.rebuilt.len();

        let summary = self
            .engine
            .regenerate(locations, &ensured.profiles, now, token, &self.progress)
            .await?;

        let config = self.engine.config();
        let cutoff = floor_to_cadence(now, config.cadence_minutes) - config.retention();
        let pruned = self.engine.store().prune_before(cutoff).await?;
        if pruned > 0 {
            tracing::info!("Pruned {} exposure records older than {}", pruned, cutoff);
        }
        self.state.write().await.records_pruned = pruned;

        Ok(summary)
    }

    /// Periodic regeneration. Never returns.
    ///
    /// Should be spawned via `tokio::spawn(service.run_scheduler(...))`.
    pub async fn run_scheduler(self: Arc<Self>, run_on_startup: bool, interval: Duration) {
        tracing::info!(
            "Regeneration scheduler started (startup run: {}, every {} h)",
            run_on_startup,
            interval.num_hours()
        );
        let period = interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(24 * 3600));
        let mut first = true;

        loop {
            if !first || run_on_startup {
                match self.run_once(Utc::now()).await {
                    Ok(_) => {}
                    Err(AppError::Conflict(_)) => {
                        tracing::info!("Scheduled regeneration skipped: a run is already active");
                    }
                    Err(_) => {}
                }
            }
            first = false;

            self.state.write().await.next_scheduled_at = Some(Utc::now() + interval);
            tokio::time::sleep(period).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::engine::EngineConfig;
    use crate::services::raster::testing::flat;
    use crate::services::store::testing::{MemoryCatalog, MemoryExposureStore};
    use crate::services::store::{ExposureRecord, ExposureStore, InstantRecord, Location, StoreError};
    use crate::services::sun::{NoaaSunPosition, SunPosition};
    use async_trait::async_trait;
    use uuid::Uuid;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse::<DateTime<Utc>>().unwrap()
    }

    fn benches(n: u128) -> Vec<Location> {
        (0..n)
            .map(|i| Location {
                id: Uuid::from_u128(i + 1),
                osm_id: Some(i as i64),
                name: None,
                lat: 47.07 + (i as f64) * 0.001,
                lon: 15.44,
                ground_elevation_m: 353.2,
                observer_height_m: 354.4,
            })
            .collect()
    }

    fn service(
        locations: Vec<Location>,
    ) -> (Arc<RegenerationService>, Arc<MemoryExposureStore>, Arc<MemoryCatalog>) {
        let store = Arc::new(MemoryExposureStore::new());
        let (svc, catalog) = service_on(locations, store.clone());
        (svc, store, catalog)
    }

    fn service_on(
        locations: Vec<Location>,
        store: Arc<dyn ExposureStore>,
    ) -> (Arc<RegenerationService>, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::new(locations));
        let config = EngineConfig {
            parallelism: 2,
            window_hours: 24,
            ..EngineConfig::default()
        };
        let engine = ExposureEngine::new(
            config,
            store.clone(),
            Arc::new(flat(353.2)),
            Arc::new(flat(353.2)),
            Arc::new(NoaaSunPosition),
        )
        .unwrap();
        let svc = Arc::new(RegenerationService::new(Arc::new(engine), catalog.clone()));
        (svc, catalog)
    }

    /// Store whose record writes always fail.
    struct RejectingWrites {
        inner: MemoryExposureStore,
    }

    #[async_trait]
    impl ExposureStore for RejectingWrites {
        async fn replace_window(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            instants: &[InstantRecord],
        ) -> Result<(), StoreError> {
            self.inner.replace_window(from, to, instants).await
        }
        async fn upsert_records(&self, _: &[ExposureRecord]) -> Result<u64, StoreError> {
            Err(StoreError::Integrity("write rejected".into()))
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
        async fn sun_position_at(&self, ts: DateTime<Utc>) -> Result<Option<SunPosition>, StoreError> {
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
    async fn test_run_once_builds_profiles_and_records() {
        let (svc, store, catalog) = service(benches(3));
        let summary = svc.run_once(utc("2024-06-21T00:00:00Z")).await.unwrap();

        assert_eq!(summary.instants, 144);
        assert!(summary.daytime_instants > 0);
        assert_eq!(summary.batches_done, summary.batches_total);
        assert_eq!(
            summary.records_written,
            3 * summary.daytime_instants as u64
        );
        assert_eq!(catalog.load_profiles().await.unwrap().len(), 3);

        let status = svc.status().await;
        assert!(!status.running);
        assert_eq!(status.total_runs, 1);
        assert_eq!(status.profiles_rebuilt, 3);
        assert_eq!(status.progress.locations_done, 3);
        assert_eq!(status.last_summary, Some(summary));
        assert!(store.all_records().await.len() > 0);
    }

    #[tokio::test]
    async fn test_failed_batch_writes_are_reported_as_error() {
        let store = Arc::new(RejectingWrites {
            inner: MemoryExposureStore::new(),
        });
        let (svc, _) = service_on(benches(2), store);
        let summary = svc.run_once(utc("2024-06-21T00:00:00Z")).await.unwrap();
        assert!(summary.batches_failed > 0);

        let status = svc.status().await;
        let error = status.last_error.expect("failed batches must surface");
        assert!(error.contains("batches failed"), "{}", error);
        assert_eq!(status.last_summary, Some(summary));
    }

    #[tokio::test]
    async fn test_clean_run_clears_previous_error() {
        let (svc, _, _) = service(benches(1));
        svc.state.write().await.last_error = Some("earlier failure".into());
        svc.run_once(utc("2024-06-21T00:00:00Z")).await.unwrap();
        assert!(svc.status().await.last_error.is_none());
    }

    #[tokio::test]
    async fn test_second_run_reuses_profiles_and_is_deterministic() {
        let (svc, store, _) = service(benches(2));
        let now = utc("2024-06-21T00:00:00Z");
        svc.run_once(now).await.unwrap();
        let first = store.all_records().await;

        svc.run_once(now).await.unwrap();
        assert_eq!(svc.status().await.profiles_rebuilt, 0);
        assert_eq!(store.all_records().await, first);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_rejected() {
        let (svc, _, _) = service(benches(1));
        let _held = svc.claim().await.unwrap();
        let err = svc.run_once(utc("2024-06-21T00:00:00Z")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(matches!(svc.trigger().await, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_cancel_without_active_run() {
        let (svc, _, _) = service(benches(1));
        assert!(!svc.cancel().await);
    }

    #[tokio::test]
    async fn test_cancel_signals_active_token() {
        let (svc, _, _) = service(benches(1));
        let token = svc.claim().await.unwrap();
        assert!(svc.cancel().await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_slot_is_released_after_run() {
        let (svc, _, _) = service(benches(1));
        let now = utc("2024-06-21T00:00:00Z");
        svc.run_once(now).await.unwrap();
        assert!(svc.run_once(now).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_prunes_beyond_retention() {
        let (svc, store, _) = service(benches(1));
        let old = utc("2024-06-01T10:00:00Z");
        let instants = vec![InstantRecord {
            ts: old,
            sun: SunPosition {
                azimuth_deg: 180.0,
                elevation_deg: 60.0,
            },
        }];
        store
            .replace_window(old, old + Duration::hours(1), &instants)
            .await
            .unwrap();
        store
            .upsert_records(&[ExposureRecord {
                location_id: Uuid::from_u128(1),
                ts: old,
                exposure: crate::services::exposure::Exposure::Exposed,
            }])
            .await
            .unwrap();

        svc.run_once(utc("2024-06-21T00:00:00Z")).await.unwrap();
        assert_eq!(svc.status().await.records_pruned, 1);
        assert!(store.all_records().await.iter().all(|r| r.ts > old));
        assert_eq!(store.sun_position_at(old).await.unwrap(), None);
    }
}
