use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{LocationRow, ProfileRow, WeatherForecastRow};
use crate::helpers::{dec_to_f64, f64_to_decimal_1dp, f64_to_decimal_full};
use crate::services::horizon::HorizonProfile;
use crate::services::osm::ImportedLocation;
use crate::services::weather::{ForecastHour, RegionId};

/// Observer heights closer than this are considered unchanged (metres).
const HEIGHT_EPSILON_M: f64 = 1e-6;

/// Insert or update a location by OSM id.
///
/// Returns the location id and whether its observer height changed, in which
/// case the caller should invalidate the stored horizon profile.
pub async fn upsert_location_from_osm(
    pool: &PgPool,
    loc: &ImportedLocation,
) -> Result<(Uuid, bool), sqlx::Error> {
    let (id, previous_height): (Uuid, Option<Decimal>) = sqlx::query_as(
        "WITH prev AS (
             SELECT observer_height_m FROM locations WHERE osm_id = $2
         )
         INSERT INTO locations (
             id, osm_id, name, latitude, longitude,
             ground_elevation_m, observer_height_m, created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
         ON CONFLICT (osm_id) DO UPDATE SET
             name = EXCLUDED.name,
             latitude = EXCLUDED.latitude,
             longitude = EXCLUDED.longitude,
             ground_elevation_m = EXCLUDED.ground_elevation_m,
             observer_height_m = EXCLUDED.observer_height_m,
             updated_at = NOW()
         RETURNING id, (SELECT observer_height_m FROM prev)",
    )
    .bind(Uuid::new_v4())
    .bind(loc.osm_id)
    .bind(&loc.name)
    .bind(f64_to_decimal_full(loc.lat))
    .bind(f64_to_decimal_full(loc.lon))
    .bind(f64_to_decimal_full(loc.ground_elevation_m))
    .bind(f64_to_decimal_full(loc.observer_height_m))
    .fetch_one(pool)
    .await?;

    let changed = previous_height
        .map(|prev| (dec_to_f64(prev) - loc.observer_height_m).abs() > HEIGHT_EPSILON_M)
        .unwrap_or(false);
    Ok((id, changed))
}

/// Delete the stored horizon profile of a location.
pub async fn delete_profile(pool: &PgPool, location_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM horizon_profiles WHERE location_id = $1")
        .bind(location_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// List all locations, ordered by id.
pub async fn list_locations(pool: &PgPool) -> Result<Vec<LocationRow>, sqlx::Error> {
    sqlx::query_as::<_, LocationRow>(
        "SELECT id, osm_id, name, latitude, longitude, ground_elevation_m, observer_height_m
         FROM locations ORDER BY id",
    )
    .fetch_all(pool)
    .await
}

/// Get a single location by id.
pub async fn get_location(pool: &PgPool, id: Uuid) -> Result<Option<LocationRow>, sqlx::Error> {
    sqlx::query_as::<_, LocationRow>(
        "SELECT id, osm_id, name, latitude, longitude, ground_elevation_m, observer_height_m
         FROM locations WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Get the locations among `ids`, ordered by id. Unknown ids are skipped.
pub async fn get_locations(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<LocationRow>, sqlx::Error> {
    sqlx::query_as::<_, LocationRow>(
        "SELECT id, osm_id, name, latitude, longitude, ground_elevation_m, observer_height_m
         FROM locations WHERE id = ANY($1) ORDER BY id",
    )
    .bind(ids)
    .fetch_all(pool)
    .await
}

/// Locations inside a lat/lon box (inclusive bounds).
pub async fn locations_in_bbox(
    pool: &PgPool,
    (min_lat, max_lat, min_lon, max_lon): (f64, f64, f64, f64),
) -> Result<Vec<LocationRow>, sqlx::Error> {
    sqlx::query_as::<_, LocationRow>(
        "SELECT id, osm_id, name, latitude, longitude, ground_elevation_m, observer_height_m
         FROM locations
         WHERE latitude BETWEEN $1 AND $2 AND longitude BETWEEN $3 AND $4",
    )
    .bind(f64_to_decimal_full(min_lat))
    .bind(f64_to_decimal_full(max_lat))
    .bind(f64_to_decimal_full(min_lon))
    .bind(f64_to_decimal_full(max_lon))
    .fetch_all(pool)
    .await
}

/// Load every stored horizon profile.
pub async fn load_profiles(pool: &PgPool) -> Result<Vec<ProfileRow>, sqlx::Error> {
    sqlx::query_as::<_, ProfileRow>(
        "SELECT location_id, bin_width_deg, observer_height_m, angles_deg,
                low_confidence, terrain_fingerprint, built_at
         FROM horizon_profiles",
    )
    .fetch_all(pool)
    .await
}

/// Insert or replace the horizon profiles of several locations in one transaction.
pub async fn save_profiles(
    pool: &PgPool,
    profiles: &[(Uuid, HorizonProfile)],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for (location_id, profile) in profiles {
        sqlx::query(
            "INSERT INTO horizon_profiles (
                 location_id, bin_width_deg, observer_height_m, angles_deg,
                 low_confidence, terrain_fingerprint, built_at
             ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
             ON CONFLICT (location_id) DO UPDATE SET
                 bin_width_deg = EXCLUDED.bin_width_deg,
                 observer_height_m = EXCLUDED.observer_height_m,
                 angles_deg = EXCLUDED.angles_deg,
                 low_confidence = EXCLUDED.low_confidence,
                 terrain_fingerprint = EXCLUDED.terrain_fingerprint,
                 built_at = NOW()",
        )
        .bind(location_id)
        .bind(profile.bin_width_deg())
        .bind(profile.observer_height_m())
        .bind(profile.angles_deg())
        .bind(profile.low_confidence())
        .bind(profile.terrain_fingerprint())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// Upsert the hourly forecast of one region.
pub async fn upsert_weather_forecasts(
    pool: &PgPool,
    region: RegionId,
    hours: &[ForecastHour],
    fetched_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    if hours.is_empty() {
        return Ok(0);
    }
    let times: Vec<DateTime<Utc>> = hours.iter().map(|h| h.hour).collect();
    let clouds: Vec<Decimal> = hours
        .iter()
        .map(|h| f64_to_decimal_1dp(h.cloud_cover_pct))
        .collect();
    let sunshine: Vec<Option<f64>> = hours.iter().map(|h| h.sunshine_seconds).collect();

    let result = sqlx::query(
        "INSERT INTO weather_forecasts (region_id, forecast_time, cloud_cover_pct, sunshine_seconds, fetched_at)
         SELECT $1, t.forecast_time, t.cloud_cover_pct, t.sunshine_seconds, $5
         FROM UNNEST($2::timestamptz[], $3::numeric[], $4::float8[])
              AS t(forecast_time, cloud_cover_pct, sunshine_seconds)
         ON CONFLICT (region_id, forecast_time) DO UPDATE SET
             cloud_cover_pct = EXCLUDED.cloud_cover_pct,
             sunshine_seconds = EXCLUDED.sunshine_seconds,
             fetched_at = EXCLUDED.fetched_at",
    )
    .bind(region.0)
    .bind(&times)
    .bind(&clouds)
    .bind(&sunshine)
    .bind(fetched_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Load forecast entries at or after `since`, grouped by region then time.
pub async fn load_weather_forecasts(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<WeatherForecastRow>, sqlx::Error> {
    sqlx::query_as::<_, WeatherForecastRow>(
        "SELECT region_id, forecast_time, cloud_cover_pct, sunshine_seconds, fetched_at
         FROM weather_forecasts
         WHERE forecast_time >= $1
         ORDER BY region_id, forecast_time",
    )
    .bind(since)
    .fetch_all(pool)
    .await
}

/// Delete forecast entries older than `cutoff`.
pub async fn prune_weather_forecasts(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM weather_forecasts WHERE forecast_time < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
