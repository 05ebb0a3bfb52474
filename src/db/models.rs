use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::helpers::dec_to_f64;
use crate::services::exposure::Exposure;
use crate::services::store::{ExposureRecord, InstantRecord, Location};
use crate::services::sun::SunPosition;
use crate::services::weather::ForecastHour;

/// A catalog location (bench) imported from OSM.
#[derive(Debug, Clone, FromRow)]
pub struct LocationRow {
    pub id: Uuid,
    pub osm_id: Option<i64>,
    pub name: Option<String>,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub ground_elevation_m: Decimal,
    pub observer_height_m: Decimal,
}

impl From<LocationRow> for Location {
    fn from(row: LocationRow) -> Self {
        Location {
            id: row.id,
            osm_id: row.osm_id,
            name: row.name,
            lat: dec_to_f64(row.latitude),
            lon: dec_to_f64(row.longitude),
            ground_elevation_m: dec_to_f64(row.ground_elevation_m),
            observer_height_m: dec_to_f64(row.observer_height_m),
        }
    }
}

/// A persisted horizon profile. Angles and confidence flags are parallel
/// arrays indexed by bin.
#[derive(Debug, Clone, FromRow)]
#[allow(dead_code)] // built_at is selected for manual inspection only
pub struct ProfileRow {
    pub location_id: Uuid,
    pub bin_width_deg: f64,
    pub observer_height_m: f64,
    pub angles_deg: Vec<f64>,
    pub low_confidence: Vec<bool>,
    pub terrain_fingerprint: String,
    pub built_at: DateTime<Utc>,
}

/// A point of the time grid.
#[derive(Debug, Clone, FromRow)]
pub struct InstantRow {
    pub ts: DateTime<Utc>,
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
}

impl From<InstantRow> for InstantRecord {
    fn from(row: InstantRow) -> Self {
        InstantRecord {
            ts: row.ts,
            sun: SunPosition {
                azimuth_deg: row.azimuth_deg,
                elevation_deg: row.elevation_deg,
            },
        }
    }
}

/// A clear-sky exposure result; `exposed` is NULL when unknown.
#[derive(Debug, Clone, FromRow)]
pub struct ExposureRow {
    pub location_id: Uuid,
    pub ts: DateTime<Utc>,
    pub exposed: Option<bool>,
}

impl From<ExposureRow> for ExposureRecord {
    fn from(row: ExposureRow) -> Self {
        ExposureRecord {
            location_id: row.location_id,
            ts: row.ts,
            exposure: Exposure::from_bool(row.exposed),
        }
    }
}

/// One hourly cloud-cover value of a region forecast.
#[derive(Debug, Clone, FromRow)]
pub struct WeatherForecastRow {
    pub region_id: i64,
    pub forecast_time: DateTime<Utc>,
    pub cloud_cover_pct: Decimal,
    pub sunshine_seconds: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl WeatherForecastRow {
    pub fn to_hour(&self) -> ForecastHour {
        ForecastHour {
            hour: self.forecast_time,
            cloud_cover_pct: dec_to_f64(self.cloud_cover_pct),
            sunshine_seconds: self.sunshine_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_location_row_conversion() {
        let row = LocationRow {
            id: Uuid::from_u128(1),
            osm_id: Some(1001),
            name: Some("Murufer".into()),
            latitude: Decimal::from_str("47.0707").unwrap(),
            longitude: Decimal::from_str("15.4395").unwrap(),
            ground_elevation_m: Decimal::from_str("353.2").unwrap(),
            observer_height_m: Decimal::from_str("354.4").unwrap(),
        };
        let loc = Location::from(row);
        assert!((loc.lat - 47.0707).abs() < 1e-10);
        assert!((loc.observer_height_m - 354.4).abs() < 1e-10);
        assert_eq!(loc.osm_id, Some(1001));
    }

    #[test]
    fn test_null_exposed_is_unknown() {
        let row = ExposureRow {
            location_id: Uuid::from_u128(1),
            ts: "2024-06-21T10:00:00Z".parse().unwrap(),
            exposed: None,
        };
        assert_eq!(ExposureRecord::from(row).exposure, Exposure::Unknown);
    }

    #[test]
    fn test_weather_row_to_hour() {
        let row = WeatherForecastRow {
            region_id: 42,
            forecast_time: "2024-06-21T10:00:00Z".parse().unwrap(),
            cloud_cover_pct: Decimal::from_str("35.5").unwrap(),
            sunshine_seconds: Some(900.0),
            fetched_at: "2024-06-21T09:55:00Z".parse().unwrap(),
        };
        let hour = row.to_hour();
        assert_eq!(hour.cloud_cover_pct, 35.5);
        assert_eq!(hour.sunshine_seconds, Some(900.0));
    }
}
