//! PostgreSQL implementations of the exposure store and location catalog.
//!
//! `exposure_records` is range-partitioned by `ts` with one partition per UTC
//! day (`exposure_records_YYYYMMDD`). Partitions are created on demand before
//! writes and dropped whole by retention.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use super::models::{ExposureRow, InstantRow, ProfileRow};
use super::queries;
use crate::services::horizon::HorizonProfile;
use crate::helpers::bounding_box;
use crate::services::store::{
    nearest_within, ExposureRecord, ExposureStore, InstantRecord, Location, LocationCatalog,
    NearbyLocation, StoreError,
};
use crate::services::sun::SunPosition;

const PARTITION_PREFIX: &str = "exposure_records_";

/// Postgres error code for a foreign-key violation.
const FOREIGN_KEY_VIOLATION: &str = "23503";

pub fn partition_name(day: NaiveDate) -> String {
    format!("{}{}", PARTITION_PREFIX, day.format("%Y%m%d"))
}

/// Day encoded in a partition name, if it is one of ours.
pub fn partition_day(name: &str) -> Option<NaiveDate> {
    let suffix = name.strip_prefix(PARTITION_PREFIX)?;
    NaiveDate::parse_from_str(suffix, "%Y%m%d").ok()
}

/// UTC days touched by the half-open range `[from, to)`.
fn days_in(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    if from >= to {
        return days;
    }
    let last = (to - Duration::nanoseconds(1)).date_naive();
    let mut day = from.date_naive();
    while day <= last {
        days.push(day);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

async fn ensure_partition(tx: &mut Transaction<'_, Postgres>, day: NaiveDate) -> Result<(), StoreError> {
    let next = day
        .succ_opt()
        .ok_or_else(|| StoreError::Integrity(format!("no day after {}", day)))?;
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF exposure_records
         FOR VALUES FROM ('{} 00:00:00+00') TO ('{} 00:00:00+00')",
        partition_name(day),
        day.format("%Y-%m-%d"),
        next.format("%Y-%m-%d")
    );
    sqlx::query(&ddl).execute(&mut **tx).await?;
    Ok(())
}

fn map_write_error(err: sqlx::Error) -> StoreError {
    let is_fk = err
        .as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == FOREIGN_KEY_VIOLATION);
    if is_fk {
        StoreError::Integrity(format!("record references a missing instant or location: {}", err))
    } else {
        StoreError::Database(err)
    }
}

#[derive(Clone)]
pub struct PgExposureStore {
    pool: PgPool,
}

impl PgExposureStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExposureStore for PgExposureStore {
    async fn replace_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        instants: &[InstantRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Records cascade with their instants
        sqlx::query("DELETE FROM time_instants WHERE ts >= $1 AND ts < $2")
            .bind(from)
            .bind(to)
            .execute(&mut *tx)
            .await?;

        for day in days_in(from, to) {
            ensure_partition(&mut tx, day).await?;
        }

        if !instants.is_empty() {
            let ts: Vec<DateTime<Utc>> = instants.iter().map(|i| i.ts).collect();
            let az: Vec<f64> = instants.iter().map(|i| i.sun.azimuth_deg).collect();
            let el: Vec<f64> = instants.iter().map(|i| i.sun.elevation_deg).collect();
            sqlx::query(
                "INSERT INTO time_instants (ts, azimuth_deg, elevation_deg)
                 SELECT * FROM UNNEST($1::timestamptz[], $2::float8[], $3::float8[])
                 ON CONFLICT (ts) DO UPDATE SET
                     azimuth_deg = EXCLUDED.azimuth_deg,
                     elevation_deg = EXCLUDED.elevation_deg",
            )
            .bind(&ts)
            .bind(&az)
            .bind(&el)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_records(&self, records: &[ExposureRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let days: BTreeSet<NaiveDate> = records.iter().map(|r| r.ts.date_naive()).collect();
        for day in days {
            ensure_partition(&mut tx, day).await?;
        }

        let ids: Vec<Uuid> = records.iter().map(|r| r.location_id).collect();
        let ts: Vec<DateTime<Utc>> = records.iter().map(|r| r.ts).collect();
        let exposed: Vec<Option<bool>> = records.iter().map(|r| r.exposure.as_bool()).collect();

        let result = sqlx::query(
            "INSERT INTO exposure_records (location_id, ts, exposed)
             SELECT * FROM UNNEST($1::uuid[], $2::timestamptz[], $3::bool[])
             ON CONFLICT (location_id, ts) DO UPDATE SET exposed = EXCLUDED.exposed",
        )
        .bind(&ids)
        .bind(&ts)
        .bind(&exposed)
        .execute(&mut *tx)
        .await
        .map_err(map_write_error)?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn records_for_location(
        &self,
        location_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExposureRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ExposureRow>(
            "SELECT location_id, ts, exposed FROM exposure_records
             WHERE location_id = $1 AND ts >= $2 AND ts < $3
             ORDER BY ts",
        )
        .bind(location_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ExposureRecord::from).collect())
    }

    async fn records_for_locations(
        &self,
        location_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExposureRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ExposureRow>(
            "SELECT location_id, ts, exposed FROM exposure_records
             WHERE location_id = ANY($1) AND ts >= $2 AND ts < $3
             ORDER BY ts, location_id",
        )
        .bind(location_ids)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ExposureRecord::from).collect())
    }

    async fn records_for_instant(
        &self,
        ts: DateTime<Utc>,
        location_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ExposureRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ExposureRow>(
            "SELECT location_id, ts, exposed FROM exposure_records
             WHERE ts = $1 AND ($2::uuid[] IS NULL OR location_id = ANY($2))
             ORDER BY location_id",
        )
        .bind(ts)
        .bind(location_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ExposureRecord::from).collect())
    }

    async fn sun_position_at(&self, ts: DateTime<Utc>) -> Result<Option<SunPosition>, StoreError> {
        let row = sqlx::query_as::<_, InstantRow>(
            "SELECT ts, azimuth_deg, elevation_deg FROM time_instants WHERE ts = $1",
        )
        .bind(ts)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| InstantRecord::from(r).sun))
    }

    async fn instants_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<InstantRecord>, StoreError> {
        let rows = sqlx::query_as::<_, InstantRow>(
            "SELECT ts, azimuth_deg, elevation_deg FROM time_instants
             WHERE ts >= $1 AND ts < $2
             ORDER BY ts",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InstantRecord::from).collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff_day = cutoff.date_naive();
        let partitions: Vec<String> = sqlx::query_scalar(
            "SELECT c.relname::text
             FROM pg_inherits i
             JOIN pg_class c ON c.oid = i.inhrelid
             JOIN pg_class p ON p.oid = i.inhparent
             WHERE p.relname = 'exposure_records'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;

        for name in partitions {
            let Some(day) = partition_day(&name) else {
                continue;
            };
            if day >= cutoff_day {
                continue;
            }
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", name))
                .fetch_one(&mut *tx)
                .await?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", name))
                .execute(&mut *tx)
                .await?;
            tracing::debug!("Dropped exposure partition {} ({} rows)", name, count);
            removed += count.max(0) as u64;
        }

        // Boundary day is trimmed row by row
        let trimmed = sqlx::query("DELETE FROM exposure_records WHERE ts < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        removed += trimmed.rows_affected();

        sqlx::query("DELETE FROM time_instants WHERE ts < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(removed)
    }
}

#[derive(Clone)]
pub struct PgLocationCatalog {
    pool: PgPool,
}

impl PgLocationCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn profile_from_row(row: ProfileRow) -> Result<(Uuid, HorizonProfile), StoreError> {
    let id = row.location_id;
    HorizonProfile::from_parts(
        row.bin_width_deg,
        row.angles_deg,
        row.low_confidence,
        row.terrain_fingerprint,
        row.observer_height_m,
    )
    .map(|p| (id, p))
    .map_err(|e| StoreError::Corrupt(format!("profile for {}: {}", id, e)))
}

#[async_trait]
impl LocationCatalog for PgLocationCatalog {
    async fn list_locations(&self) -> Result<Vec<Location>, StoreError> {
        let rows = queries::list_locations(&self.pool).await?;
        Ok(rows.into_iter().map(Location::from).collect())
    }

    async fn get_location(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
        Ok(queries::get_location(&self.pool, id)
            .await?
            .map(Location::from))
    }

    async fn get_locations(&self, ids: &[Uuid]) -> Result<Vec<Location>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = queries::get_locations(&self.pool, ids).await?;
        Ok(rows.into_iter().map(Location::from).collect())
    }

    async fn locations_near(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<Vec<NearbyLocation>, StoreError> {
        // Box prefilter in SQL, exact great-circle check here
        let rows = queries::locations_in_bbox(&self.pool, bounding_box(lat, lon, radius_m)).await?;
        let candidates = rows.into_iter().map(Location::from).collect();
        Ok(nearest_within(candidates, lat, lon, radius_m))
    }

    async fn load_profiles(&self) -> Result<HashMap<Uuid, HorizonProfile>, StoreError> {
        let rows = queries::load_profiles(&self.pool).await?;
        let mut profiles = HashMap::with_capacity(rows.len());
        for row in rows {
            // A corrupt profile is rebuilt on the next run
            match profile_from_row(row) {
                Ok((id, profile)) => {
                    profiles.insert(id, profile);
                }
                Err(e) => tracing::warn!("Ignoring stored horizon profile: {}", e),
            }
        }
        Ok(profiles)
    }

    async fn save_profiles(&self, profiles: &[(Uuid, HorizonProfile)]) -> Result<(), StoreError> {
        queries::save_profiles(&self.pool, profiles).await?;
        Ok(())
    }
}
