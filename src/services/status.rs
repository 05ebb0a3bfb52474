//! Read-side facade: clear-sky exposure from the store combined with the
//! weather cache at query time.
//!
//! Lookups never fail. Store errors are logged and degrade to Unknown; the
//! only `None` a caller sees is an unknown location id. Forward searches tell
//! "nothing within the horizon" apart from "not enough data to say".

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::helpers::floor_to_cadence;
use crate::services::exposure::{Exposure, NextInstant, SunStatus};
use crate::services::store::{
    ExposureStore, InstantRecord, Location, LocationCatalog, NearbyLocation, StoreError,
};
use crate::services::sun::SunPosition;
use crate::services::weather::{MissingForecastPolicy, WeatherForecastCache};

/// Forward scans read the store one page at a time.
const SCAN_PAGE: Duration = Duration::hours(24);

/// Status of one location at one instant of the time grid.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct LocationStatus {
    pub location_id: Uuid,
    /// Grid instant the status refers to.
    pub instant: DateTime<Utc>,
    /// Clear-sky exposure (null when unknown).
    pub exposed: Option<bool>,
    /// Exposure after cloud cover (null when unknown).
    pub effective_exposed: Option<bool>,
    pub status: SunStatus,
    /// The forecast behind `effective_exposed` is older than its TTL or its
    /// last refresh failed.
    pub forecast_stale: bool,
}

pub struct QueryFacade {
    catalog: Arc<dyn LocationCatalog>,
    store: Arc<dyn ExposureStore>,
    weather: Arc<WeatherForecastCache>,
    cadence_minutes: u32,
}

/// Clear-sky exposure of an instant: the stored record if any, Shaded when
/// the sun is down, otherwise Unknown.
fn clear_sky(record: Option<Exposure>, sun: Option<SunPosition>) -> Exposure {
    match (record, sun) {
        (Some(e), _) => e,
        (None, Some(s)) if !s.is_up() => Exposure::Shaded,
        _ => Exposure::Unknown,
    }
}

fn degrade<T: Default>(result: Result<T, StoreError>, what: &str) -> T {
    result.unwrap_or_else(|e| {
        tracing::warn!("Store lookup failed ({}), degrading to unknown: {}", what, e);
        T::default()
    })
}

impl QueryFacade {
    pub fn new(
        catalog: Arc<dyn LocationCatalog>,
        store: Arc<dyn ExposureStore>,
        weather: Arc<WeatherForecastCache>,
        cadence_minutes: u32,
    ) -> Self {
        Self {
            catalog,
            store,
            weather,
            cadence_minutes,
        }
    }

    fn cadence(&self) -> Duration {
        Duration::minutes(i64::from(self.cadence_minutes.max(1)))
    }

    async fn location(&self, id: Uuid) -> Option<Location> {
        match self.catalog.get_location(id).await {
            Ok(loc) => loc,
            Err(e) => {
                tracing::warn!("Location lookup for {} failed: {}", id, e);
                None
            }
        }
    }

    /// Catalog entry of one location. Unlike status lookups this propagates
    /// store errors.
    pub async fn location_info(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
        self.catalog.get_location(id).await
    }

    /// Locations within `radius_m` of a point, nearest first.
    pub async fn locations_near(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<Vec<NearbyLocation>, StoreError> {
        self.catalog.locations_near(lat, lon, radius_m).await
    }

    /// Combine clear-sky exposure with the sky at `ts`.
    async fn combine(
        &self,
        loc: &Location,
        ts: DateTime<Utc>,
        clear: Exposure,
        now: DateTime<Utc>,
    ) -> LocationStatus {
        let (effective, stale) = if clear == Exposure::Shaded {
            (Exposure::Shaded, false)
        } else {
            let region = self.weather.region_for(loc.lat, loc.lon);
            let verdict = self.weather.sky_at(region, ts, now).await;
            (clear.and(verdict.sky), verdict.stale)
        };
        LocationStatus {
            location_id: loc.id,
            instant: ts,
            exposed: clear.as_bool(),
            effective_exposed: effective.as_bool(),
            status: SunStatus::from(effective),
            forecast_stale: stale,
        }
    }

    /// Status at the grid instant containing `now`. `None` for an unknown id.
    pub async fn get_current_status(&self, location_id: Uuid, now: DateTime<Utc>) -> Option<LocationStatus> {
        let loc = self.location(location_id).await?;
        let ts = floor_to_cadence(now, self.cadence_minutes);
        let sun = degrade(self.store.sun_position_at(ts).await, "sun position");
        let records = degrade(
            self.store
                .records_for_instant(ts, Some(&[location_id]))
                .await,
            "current record",
        );
        let clear = clear_sky(records.first().map(|r| r.exposure), sun);
        Some(self.combine(&loc, ts, clear, now).await)
    }

    /// Status for many locations with one record round-trip. Unknown ids are
    /// left out.
    pub async fn get_current_status_batch(
        &self,
        location_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Vec<LocationStatus> {
        let locations = self.locations_by_id(location_ids).await;
        let ts = floor_to_cadence(now, self.cadence_minutes);
        let sun = degrade(self.store.sun_position_at(ts).await, "sun position");
        let records: HashMap<Uuid, Exposure> = degrade(
            self.store.records_for_instant(ts, Some(location_ids)).await,
            "batch records",
        )
        .into_iter()
        .map(|r| (r.location_id, r.exposure))
        .collect();

        let mut out = Vec::with_capacity(locations.len());
        for id in location_ids {
            if let Some(loc) = locations.get(id) {
                let clear = clear_sky(records.get(id).copied(), sun);
                out.push(self.combine(loc, ts, clear, now).await);
            }
        }
        out
    }

    /// Next instant after `from` whose known effective status differs from
    /// the status at `from`, within `max_horizon`. `None` for an unknown id.
    pub async fn get_next_change(
        &self,
        location_id: Uuid,
        from: DateTime<Utc>,
        max_horizon: Duration,
    ) -> Option<NextInstant> {
        let current = self.get_current_status(location_id, from).await?;
        let loc = self.location(location_id).await?;
        let start = current.instant + self.cadence();
        let next = self
            .scan(&loc, start, from + max_horizon, from, |s| {
                s.status != SunStatus::Unknown && s.status != current.status
            })
            .await;
        Some(next)
    }

    /// First instant at or after `from` whose effective status is sunny,
    /// within `max_horizon`. `None` for an unknown id.
    pub async fn get_next_sunny_instant(
        &self,
        location_id: Uuid,
        from: DateTime<Utc>,
        max_horizon: Duration,
    ) -> Option<NextInstant> {
        let loc = self.location(location_id).await?;
        let mut start = floor_to_cadence(from, self.cadence_minutes);
        let end = from + max_horizon;

        // Without a sunny-by-default policy an hour cached as cloudy is shady
        // everywhere in the region, so the scan can start past such hours.
        if self.weather.config().missing_policy == MissingForecastPolicy::Unknown {
            let region = self.weather.region_for(loc.lat, loc.lon);
            match self.weather.first_uncloudy_hour(region, start, end).await {
                Some(hour) => start = start.max(hour),
                None => return Some(NextInstant::NoneWithinHorizon),
            }
        }

        Some(
            self.scan(&loc, start, end, from, |s| s.status == SunStatus::Sunny)
                .await,
        )
    }

    /// Next change for many locations, reading the range once. Unknown ids are
    /// left out.
    pub async fn get_next_change_batch(
        &self,
        location_ids: &[Uuid],
        from: DateTime<Utc>,
        max_horizon: Duration,
    ) -> HashMap<Uuid, NextInstant> {
        let locations = self.locations_by_id(location_ids).await;
        let ts0 = floor_to_cadence(from, self.cadence_minutes);
        let end = from + max_horizon;

        let instants = degrade(self.store.instants_between(ts0, end).await, "batch instants");
        let gap = instants.len() < self.grid_points(ts0, end);
        let mut records: HashMap<(Uuid, DateTime<Utc>), Exposure> = HashMap::new();
        for r in degrade(
            self.store.records_for_locations(location_ids, ts0, end).await,
            "batch records",
        ) {
            records.insert((r.location_id, r.ts), r.exposure);
        }

        let sun_at_start = instants.first().filter(|i| i.ts == ts0).map(|i| i.sun);

        let mut out = HashMap::with_capacity(location_ids.len());
        for id in location_ids {
            let Some(loc) = locations.get(id) else {
                continue;
            };
            let base_clear = clear_sky(records.get(&(*id, ts0)).copied(), sun_at_start);
            let base = self.combine(loc, ts0, base_clear, from).await.status;

            let mut uncertain = gap;
            let mut change = None;
            for instant in instants.iter().filter(|i| i.ts > ts0) {
                let clear = clear_sky(records.get(&(*id, instant.ts)).copied(), Some(instant.sun));
                let status = self.combine(loc, instant.ts, clear, from).await.status;
                if status != SunStatus::Unknown && status != base {
                    change = Some(instant.ts);
                    break;
                }
                uncertain |= status == SunStatus::Unknown;
            }
            let next = match change {
                Some(ts) => NextInstant::Found(ts),
                None if uncertain => NextInstant::Unknown,
                None => NextInstant::NoneWithinHorizon,
            };
            out.insert(*id, next);
        }
        out
    }

    async fn locations_by_id(&self, ids: &[Uuid]) -> HashMap<Uuid, Location> {
        degrade(self.catalog.get_locations(ids).await, "locations")
            .into_iter()
            .map(|l| (l.id, l))
            .collect()
    }

    /// Number of grid instants in `[from, to)`.
    fn grid_points(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        let step = self.cadence();
        let mut first = floor_to_cadence(from, self.cadence_minutes.max(1));
        if first < from {
            first += step;
        }
        if first >= to {
            return 0;
        }
        let span = (to - first).num_seconds();
        let step = step.num_seconds();
        ((span + step - 1) / step) as usize
    }

    /// Walk grid instants in `[start, end)` page by page, stopping at the first
    /// one whose status matches. Instants past the match are never evaluated.
    ///
    /// Without a match the answer is `Unknown` if an instant on the way had an
    /// unknown status or the store is missing grid instants (outside the
    /// computed window, or a failed read).
    async fn scan<F>(
        &self,
        loc: &Location,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
        is_match: F,
    ) -> NextInstant
    where
        F: Fn(&LocationStatus) -> bool,
    {
        let mut uncertain = false;
        let mut page_start = start;
        while page_start < end {
            let page_end = (page_start + SCAN_PAGE).min(end);
            let instants: Vec<InstantRecord> = degrade(
                self.store.instants_between(page_start, page_end).await,
                "scan instants",
            );
            if instants.len() < self.grid_points(page_start, page_end) {
                uncertain = true;
            }
            let records: HashMap<DateTime<Utc>, Exposure> = degrade(
                self.store
                    .records_for_location(loc.id, page_start, page_end)
                    .await,
                "scan records",
            )
            .into_iter()
            .map(|r| (r.ts, r.exposure))
            .collect();

            for instant in &instants {
                let clear = clear_sky(records.get(&instant.ts).copied(), Some(instant.sun));
                let status = self.combine(loc, instant.ts, clear, now).await;
                if is_match(&status) {
                    return NextInstant::Found(instant.ts);
                }
                uncertain |= status.status == SunStatus::Unknown;
            }
            page_start = page_end;
        }
        if uncertain {
            NextInstant::Unknown
        } else {
            NextInstant::NoneWithinHorizon
        }
    }
}
