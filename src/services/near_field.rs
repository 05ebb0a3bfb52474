//! Near-field line-of-sight check against the surface model.
//!
//! Marches outward along the sun azimuth with steps that grow with distance,
//! comparing the surface height with the height of the sun ray. The first
//! obstructing sample ends the march.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::services::exposure::Exposure;
use crate::services::raster::{destination_point, ElevationSampler};
use crate::services::sun::SunPosition;

/// How samples without surface coverage are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoDataPolicy {
    /// An unobstructed ray that crossed missing data is Unknown.
    #[default]
    Unknown,
    /// Missing data never obstructs.
    Optimistic,
}

impl FromStr for NoDataPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(NoDataPolicy::Unknown),
            "optimistic" => Ok(NoDataPolicy::Optimistic),
            other => Err(format!("unknown no-data policy '{}'", other)),
        }
    }
}

/// Step size used up to (exclusive) `until_m`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepBand {
    pub until_m: f64,
    pub step_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearFieldParams {
    /// Ascending by `until_m`; the last band's limit is the max range.
    pub bands: Vec<StepBand>,
}

impl Default for NearFieldParams {
    fn default() -> Self {
        Self {
            bands: vec![
                StepBand {
                    until_m: 100.0,
                    step_m: 2.0,
                },
                StepBand {
                    until_m: 200.0,
                    step_m: 5.0,
                },
                StepBand {
                    until_m: 500.0,
                    step_m: 10.0,
                },
            ],
        }
    }
}

impl NearFieldParams {
    pub fn max_range_m(&self) -> f64 {
        self.bands.last().map(|b| b.until_m).unwrap_or(0.0)
    }

    fn step_at(&self, distance_m: f64) -> Option<f64> {
        self.bands
            .iter()
            .find(|b| distance_m < b.until_m)
            .map(|b| b.step_m)
            .filter(|s| *s > 0.0)
    }

    /// Sample distances in marching order.
    pub fn distances(&self) -> Vec<f64> {
        let max = self.max_range_m();
        let mut out = Vec::new();
        let mut d = 0.0;
        while let Some(step) = self.step_at(d) {
            d += step;
            if d > max + 1e-9 {
                break;
            }
            out.push(d);
        }
        out
    }
}

/// Observer placement for a single evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Observer {
    pub lat: f64,
    pub lon: f64,
    pub height_m: f64,
}

/// Decide whether the sun is visible from `observer` past nearby structures.
///
/// Sun at or below the horizon returns Shaded without sampling.
pub fn evaluate(
    surface: &dyn ElevationSampler,
    observer: Observer,
    sun: SunPosition,
    params: &NearFieldParams,
    policy: NoDataPolicy,
) -> Exposure {
    if !sun.is_up() {
        return Exposure::Shaded;
    }
    let slope = sun.elevation_deg.to_radians().tan();
    let mut crossed_no_data = false;

    for distance in params.distances() {
        let (lat, lon) = destination_point(observer.lat, observer.lon, sun.azimuth_deg, distance);
        let ray_height = observer.height_m + distance * slope;
        match surface.sample(lat, lon) {
            Some(h) if h > ray_height => return Exposure::Shaded,
            Some(_) => {}
            None => crossed_no_data = true,
        }
    }

    if crossed_no_data && policy == NoDataPolicy::Unknown {
        Exposure::Unknown
    } else {
        Exposure::Exposed
    }
}
