//! Shared helpers for Decimal ↔ f64 conversions, time-grid rounding and
//! great-circle distances.
//!
//! Two f64→Decimal strategies exist because forecast values and geo values
//! have different precision requirements:
//!
//! - `f64_to_decimal_1dp`: rounds to 1 decimal place (cloud cover percent)
//! - `f64_to_decimal_full`: preserves full f64 precision (lat, lon, elevation)
//!
//! Both return `Decimal::ZERO` for non-finite inputs (NaN, ±Inf).

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Convert an f64 to Decimal, rounded to 1 decimal place.
pub(crate) fn f64_to_decimal_1dp(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_1dp received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    Decimal::from_str_exact(&format!("{:.1}", v)).unwrap_or_default()
}

/// Convert an f64 to Decimal preserving full precision.
pub(crate) fn f64_to_decimal_full(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_full received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    Decimal::from_f64(v).unwrap_or_else(|| Decimal::new(v as i64, 0))
}

/// Convert a Decimal to f64, defaulting to 0.0 for values that can't be represented.
pub(crate) fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Floor a timestamp to the start of its cadence slot (minutes since midnight UTC).
pub(crate) fn floor_to_cadence(dt: DateTime<Utc>, cadence_minutes: u32) -> DateTime<Utc> {
    let step = TimeDelta::minutes(i64::from(cadence_minutes.max(1)));
    dt.duration_trunc(step).unwrap_or(dt)
}

/// Floor a timestamp to the start of its UTC hour.
pub(crate) fn floor_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_cadence(dt, 60)
}

/// Mean Earth radius (metres).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance between two WGS84 points in metres (haversine).
pub(crate) fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Lat/lon box `(min_lat, max_lat, min_lon, max_lon)` containing every point
/// within `radius_m` of (lat, lon). Used as an index-friendly prefilter.
pub(crate) fn bounding_box(lat: f64, lon: f64, radius_m: f64) -> (f64, f64, f64, f64) {
    let d_lat = (radius_m / EARTH_RADIUS_M).to_degrees();
    let cos_lat = lat.to_radians().cos().abs().max(1e-6);
    let d_lon = (d_lat / cos_lat).min(180.0);
    (
        (lat - d_lat).max(-90.0),
        (lat + d_lat).min(90.0),
        lon - d_lon,
        lon + d_lon,
    )
}
