//! Solar position provider.
//!
//! NOAA solar-position equations (Meeus, low-precision series). Accuracy is
//! well under 0.1° for dates within a few decades of J2000, which is far below
//! the angular resolution of the horizon profiles.
//!
//! Convention used by every consumer: azimuth in degrees clockwise from
//! geographic north, normalised to [0, 360); elevation in degrees above the
//! horizontal plane, in [-90, 90]. No atmospheric refraction correction.

use chrono::{DateTime, Utc};

/// Sun direction as seen from a point on the ground.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
}

impl SunPosition {
    /// Returned for inputs that cannot be evaluated: sun straight below.
    pub const BELOW_HORIZON: SunPosition = SunPosition {
        azimuth_deg: 0.0,
        elevation_deg: -90.0,
    };

    pub fn is_up(&self) -> bool {
        self.elevation_deg > 0.0
    }
}

/// Source of solar positions. Implementations must be pure and must not panic.
pub trait SunPositionProvider: Send + Sync {
    fn position(&self, at: DateTime<Utc>, lat: f64, lon: f64) -> SunPosition;
}

/// Provider backed by the NOAA equations below.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoaaSunPosition;

impl SunPositionProvider for NoaaSunPosition {
    fn position(&self, at: DateTime<Utc>, lat: f64, lon: f64) -> SunPosition {
        solar_position(at, lat, lon)
    }
}

const DEG: f64 = std::f64::consts::PI / 180.0;

/// Julian day of 1970-01-01T00:00:00Z.
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const J2000_JD: f64 = 2_451_545.0;

fn normalize_degrees(deg: f64) -> f64 {
    let d = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if d >= 360.0 {
        0.0
    } else {
        d
    }
}

/// Compute the solar position for a UTC instant at (lat, lon) in degrees.
///
/// Never panics: latitude is clamped to [-90, 90], longitude is wrapped, and
/// non-finite input yields [`SunPosition::BELOW_HORIZON`].
pub fn solar_position(at: DateTime<Utc>, lat: f64, lon: f64) -> SunPosition {
    if !lat.is_finite() || !lon.is_finite() {
        tracing::warn!(
            "solar_position received non-finite coordinates ({}, {})",
            lat,
            lon
        );
        return SunPosition::BELOW_HORIZON;
    }
    let lat = lat.clamp(-90.0, 90.0);
    let lon = (lon + 180.0).rem_euclid(360.0) - 180.0;

    let unix_secs = at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) * 1e-9;
    let jd = unix_secs / 86_400.0 + UNIX_EPOCH_JD;
    let t = (jd - J2000_JD) / 36_525.0;

    let mean_longitude = normalize_degrees(280.46646 + t * (36_000.76983 + t * 0.000_303_2));
    let mean_anomaly = 357.52911 + t * (35_999.05029 - t * 0.000_153_7);
    let eccentricity = 0.016_708_634 - t * (0.000_042_037 + t * 0.000_000_126_7);

    let m = mean_anomaly * DEG;
    let center = m.sin() * (1.914_602 - t * (0.004_817 + t * 0.000_014))
        + (2.0 * m).sin() * (0.019_993 - t * 0.000_101)
        + (3.0 * m).sin() * 0.000_289;

    let omega = (125.04 - 1_934.136 * t) * DEG;
    let apparent_longitude = (mean_longitude + center - 0.005_69 - 0.004_78 * omega.sin()) * DEG;

    let mean_obliquity =
        23.0 + (26.0 + (21.448 - t * (46.815 + t * (0.000_59 - t * 0.001_813))) / 60.0) / 60.0;
    let obliquity = (mean_obliquity + 0.002_56 * omega.cos()) * DEG;

    let declination = (obliquity.sin() * apparent_longitude.sin()).asin();

    let y = (obliquity / 2.0).tan().powi(2);
    let l0 = mean_longitude * DEG;
    let equation_of_time_min = 4.0
        * (y * (2.0 * l0).sin() - 2.0 * eccentricity * m.sin()
            + 4.0 * eccentricity * y * m.sin() * (2.0 * l0).cos()
            - 0.5 * y * y * (4.0 * l0).sin()
            - 1.25 * eccentricity * eccentricity * (2.0 * m).sin())
        / DEG;

    let minutes_of_day = unix_secs.rem_euclid(86_400.0) / 60.0;
    let true_solar_time = (minutes_of_day + equation_of_time_min + 4.0 * lon).rem_euclid(1_440.0);
    let hour_angle = true_solar_time / 4.0 - 180.0;

    let lat_r = lat * DEG;
    let cos_zenith = (lat_r.sin() * declination.sin()
        + lat_r.cos() * declination.cos() * (hour_angle * DEG).cos())
    .clamp(-1.0, 1.0);
    let zenith = cos_zenith.acos();
    let elevation_deg = 90.0 - zenith / DEG;

    let denom = lat_r.cos() * zenith.sin();
    let azimuth_deg = if denom.abs() > 1e-9 {
        let cos_az = ((lat_r.sin() * cos_zenith) - declination.sin()) / denom;
        let az = 180.0 - cos_az.clamp(-1.0, 1.0).acos() / DEG;
        if hour_angle > 0.0 {
            normalize_degrees(-az)
        } else {
            normalize_degrees(az)
        }
    } else if lat > 0.0 {
        180.0
    } else {
        0.0
    };

    SunPosition {
        azimuth_deg,
        elevation_deg: elevation_deg.clamp(-90.0, 90.0),
    }
}
