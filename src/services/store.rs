//! Storage contracts for the exposure dataset and the location catalog.
//!
//! Removing a location or an instant cascades to its exposure records at the
//! schema level (`ON DELETE CASCADE`); the in-memory store used by tests
//! mirrors that for instants dropped by window replacement and retention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::helpers::haversine_m;
use crate::services::exposure::Exposure;
use crate::services::horizon::HorizonProfile;
use crate::services::sun::SunPosition;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

/// A bench (or other outdoor spot) in the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub id: Uuid,
    pub osm_id: Option<i64>,
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub ground_elevation_m: f64,
    pub observer_height_m: f64,
}

/// A point of the time grid with the sun position at the city reference point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstantRecord {
    pub ts: DateTime<Utc>,
    pub sun: SunPosition,
}

/// A catalog location with its great-circle distance from a search point.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyLocation {
    pub location: Location,
    pub distance_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureRecord {
    pub location_id: Uuid,
    pub ts: DateTime<Utc>,
    pub exposure: Exposure,
}

/// Time- and location-indexed exposure results.
///
/// Range bounds are half-open: `from` inclusive, `to` exclusive. Results are
/// ordered by timestamp, then location id.
#[async_trait]
pub trait ExposureStore: Send + Sync {
    /// Delete every instant (and, by cascade, every record) in `[from, to)`
    /// and insert `instants` in their place.
    async fn replace_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        instants: &[InstantRecord],
    ) -> Result<(), StoreError>;

    /// Idempotent upsert keyed on (location, ts). All or nothing.
    async fn upsert_records(&self, records: &[ExposureRecord]) -> Result<u64, StoreError>;

    async fn records_for_location(
        &self,
        location_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExposureRecord>, StoreError>;

    async fn records_for_locations(
        &self,
        location_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExposureRecord>, StoreError>;

    /// Records at one instant, optionally restricted to a set of locations.
    async fn records_for_instant(
        &self,
        ts: DateTime<Utc>,
        location_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ExposureRecord>, StoreError>;

    async fn sun_position_at(&self, ts: DateTime<Utc>) -> Result<Option<SunPosition>, StoreError>;

    async fn instants_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<InstantRecord>, StoreError>;

    /// Drop instants and records older than `cutoff`. Returns removed records.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Locations and their horizon profiles.
#[async_trait]
pub trait LocationCatalog: Send + Sync {
    async fn list_locations(&self) -> Result<Vec<Location>, StoreError>;

    async fn get_location(&self, id: Uuid) -> Result<Option<Location>, StoreError>;

    /// Locations among `ids`; unknown ids are ignored.
    async fn get_locations(&self, ids: &[Uuid]) -> Result<Vec<Location>, StoreError>;

    /// Locations within `radius_m` of (lat, lon), nearest first.
    async fn locations_near(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<Vec<NearbyLocation>, StoreError>;

    async fn load_profiles(&self) -> Result<HashMap<Uuid, HorizonProfile>, StoreError>;

    async fn save_profiles(&self, profiles: &[(Uuid, HorizonProfile)]) -> Result<(), StoreError>;
}

/// Keep the candidates within `radius_m` of (lat, lon), nearest first.
pub fn nearest_within(candidates: Vec<Location>, lat: f64, lon: f64, radius_m: f64) -> Vec<NearbyLocation> {
    let mut found: Vec<NearbyLocation> = candidates
        .into_iter()
        .map(|location| NearbyLocation {
            distance_m: haversine_m(lat, lon, location.lat, location.lon),
            location,
        })
        .filter(|n| n.distance_m <= radius_m)
        .collect();
    found.sort_by(|a, b| {
        a.distance_m
            .total_cmp(&b.distance_m)
            .then(a.location.id.cmp(&b.location.id))
    });
    found
}

/// In-memory store and catalog. The store partitions records by UTC day like
/// the PostgreSQL layout: retention drops whole days and only trims the
/// boundary day.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::{BTreeMap, HashSet};
    use tokio::sync::RwLock;

    type DayPartition = BTreeMap<(DateTime<Utc>, Uuid), Exposure>;

    #[derive(Default)]
    struct MemoryState {
        instants: BTreeMap<DateTime<Utc>, SunPosition>,
        partitions: BTreeMap<NaiveDate, DayPartition>,
    }

    impl MemoryState {
        fn records_in(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            mut keep: impl FnMut(Uuid) -> bool,
        ) -> Vec<ExposureRecord> {
            if from >= to {
                return Vec::new();
            }
            self.partitions
                .range(from.date_naive()..=to.date_naive())
                .flat_map(|(_, part)| part.iter())
                .filter(|((ts, id), _)| *ts >= from && *ts < to && keep(*id))
                .map(|((ts, id), e)| ExposureRecord {
                    location_id: *id,
                    ts: *ts,
                    exposure: *e,
                })
                .collect()
        }
    }

    /// Exposure store held in process memory.
    #[derive(Default)]
    pub struct MemoryExposureStore {
        state: RwLock<MemoryState>,
    }

    impl MemoryExposureStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of day partitions currently held.
        pub async fn partition_count(&self) -> usize {
            self.state.read().await.partitions.len()
        }

        pub async fn all_records(&self) -> Vec<ExposureRecord> {
            let state = self.state.read().await;
            state
                .partitions
                .values()
                .flat_map(|p| p.iter())
                .map(|((ts, id), e)| ExposureRecord {
                    location_id: *id,
                    ts: *ts,
                    exposure: *e,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ExposureStore for MemoryExposureStore {
        async fn replace_window(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            instants: &[InstantRecord],
        ) -> Result<(), StoreError> {
            let mut state = self.state.write().await;
            if from < to {
                let stale: Vec<DateTime<Utc>> =
                    state.instants.range(from..to).map(|(ts, _)| *ts).collect();
                for ts in stale {
                    state.instants.remove(&ts);
                }
            }
            for part in state.partitions.values_mut() {
                part.retain(|(ts, _), _| *ts < from || *ts >= to);
            }
            state.partitions.retain(|_, p| !p.is_empty());
            for instant in instants {
                state.instants.insert(instant.ts, instant.sun);
            }
            Ok(())
        }

        async fn upsert_records(&self, records: &[ExposureRecord]) -> Result<u64, StoreError> {
            let mut state = self.state.write().await;
            if let Some(orphan) = records.iter().find(|r| !state.instants.contains_key(&r.ts)) {
                return Err(StoreError::Integrity(format!(
                    "record for {} references missing instant {}",
                    orphan.location_id, orphan.ts
                )));
            }
            for r in records {
                state
                    .partitions
                    .entry(r.ts.date_naive())
                    .or_default()
                    .insert((r.ts, r.location_id), r.exposure);
            }
            Ok(records.len() as u64)
        }

        async fn records_for_location(
            &self,
            location_id: Uuid,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<ExposureRecord>, StoreError> {
            let state = self.state.read().await;
            Ok(state.records_in(from, to, |id| id == location_id))
        }

        async fn records_for_locations(
            &self,
            location_ids: &[Uuid],
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<ExposureRecord>, StoreError> {
            let wanted: HashSet<Uuid> = location_ids.iter().copied().collect();
            let state = self.state.read().await;
            Ok(state.records_in(from, to, |id| wanted.contains(&id)))
        }

        async fn records_for_instant(
            &self,
            ts: DateTime<Utc>,
            location_ids: Option<&[Uuid]>,
        ) -> Result<Vec<ExposureRecord>, StoreError> {
            let wanted: Option<HashSet<Uuid>> = location_ids.map(|ids| ids.iter().copied().collect());
            let state = self.state.read().await;
            let end = ts + chrono::Duration::nanoseconds(1);
            Ok(state.records_in(ts, end, |id| {
                wanted.as_ref().map(|w| w.contains(&id)).unwrap_or(true)
            }))
        }

        async fn sun_position_at(&self, ts: DateTime<Utc>) -> Result<Option<SunPosition>, StoreError> {
            Ok(self.state.read().await.instants.get(&ts).copied())
        }

        async fn instants_between(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<InstantRecord>, StoreError> {
            if from >= to {
                return Ok(Vec::new());
            }
            let state = self.state.read().await;
            Ok(state
                .instants
                .range(from..to)
                .map(|(ts, sun)| InstantRecord { ts: *ts, sun: *sun })
                .collect())
        }

        async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            let mut state = self.state.write().await;
            let cutoff_day = cutoff.date_naive();
            let mut removed = 0u64;

            // Whole days before the cutoff day go at once
            let keep = state.partitions.split_off(&cutoff_day);
            removed += state.partitions.values().map(|p| p.len() as u64).sum::<u64>();
            state.partitions = keep;

            if let Some(part) = state.partitions.get_mut(&cutoff_day) {
                let before = part.len();
                part.retain(|(ts, _), _| *ts >= cutoff);
                removed += (before - part.len()) as u64;
                if part.is_empty() {
                    state.partitions.remove(&cutoff_day);
                }
            }

            state.instants = state.instants.split_off(&cutoff);
            Ok(removed)
        }
    }

    /// Location catalog held in process memory.
    #[derive(Default)]
    pub struct MemoryCatalog {
        locations: RwLock<BTreeMap<Uuid, Location>>,
        profiles: RwLock<HashMap<Uuid, HorizonProfile>>,
    }

    impl MemoryCatalog {
        pub fn new(locations: Vec<Location>) -> Self {
            Self {
                locations: RwLock::new(locations.into_iter().map(|l| (l.id, l)).collect()),
                profiles: RwLock::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl LocationCatalog for MemoryCatalog {
        async fn list_locations(&self) -> Result<Vec<Location>, StoreError> {
            Ok(self.locations.read().await.values().cloned().collect())
        }

        async fn get_location(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
            Ok(self.locations.read().await.get(&id).cloned())
        }

        async fn get_locations(&self, ids: &[Uuid]) -> Result<Vec<Location>, StoreError> {
            let locations = self.locations.read().await;
            Ok(ids.iter().filter_map(|id| locations.get(id).cloned()).collect())
        }

        async fn locations_near(
            &self,
            lat: f64,
            lon: f64,
            radius_m: f64,
        ) -> Result<Vec<NearbyLocation>, StoreError> {
            let all = self.locations.read().await.values().cloned().collect();
            Ok(nearest_within(all, lat, lon, radius_m))
        }

        async fn load_profiles(&self) -> Result<HashMap<Uuid, HorizonProfile>, StoreError> {
            Ok(self.profiles.read().await.clone())
        }

        async fn save_profiles(&self, profiles: &[(Uuid, HorizonProfile)]) -> Result<(), StoreError> {
            let mut stored = self.profiles.write().await;
            for (id, profile) in profiles {
                stored.insert(*id, profile.clone());
            }
            Ok(())
        }
    }
}
