//! Horizon profiles: per-location maximum terrain obstruction angle for every
//! azimuth bin around the full circle.
//!
//! Bin `i` covers azimuths `[i·w, (i+1)·w)` and its ray is cast along the bin
//! centre. Lookups interpolate linearly between neighbouring bin centres and
//! wrap across north, so the profile has no seam.

use serde::{Deserialize, Serialize};

use crate::errors::ComputationError;
use crate::services::raster::{destination_point, ElevationSampler};

/// Floor value of a bin with no terrain sample at all.
pub const NO_OBSTRUCTION_DEG: f64 = -90.0;

/// Ray-march parameters for profile construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonParams {
    pub bin_width_deg: f64,
    pub step_m: f64,
    pub max_range_m: f64,
}

impl Default for HorizonParams {
    fn default() -> Self {
        Self {
            bin_width_deg: 2.0,
            step_m: 20.0,
            max_range_m: 8_000.0,
        }
    }
}

impl HorizonParams {
    /// Number of bins, or an error if the width does not tile 360°.
    pub fn bin_count(&self) -> Result<usize, ComputationError> {
        bin_count_for_width(self.bin_width_deg)
    }
}

fn bin_count_for_width(width: f64) -> Result<usize, ComputationError> {
    if !width.is_finite() || width <= 0.0 || width > 360.0 {
        return Err(ComputationError::InvalidProfile(format!(
            "bin width {}° is out of range",
            width
        )));
    }
    let n = (360.0 / width).round();
    if (n * width - 360.0).abs() > 1e-9 {
        return Err(ComputationError::InvalidProfile(format!(
            "bin width {}° does not divide 360°",
            width
        )));
    }
    Ok(n as usize)
}

/// Interpolated gate value at a single azimuth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateLookup {
    pub angle_deg: f64,
    /// Set when either neighbouring bin terminated early on missing terrain.
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HorizonProfile {
    bin_width_deg: f64,
    angles_deg: Vec<f64>,
    low_confidence: Vec<bool>,
    terrain_fingerprint: String,
    observer_height_m: f64,
}

impl HorizonProfile {
    /// Rebuild a profile from stored parts, checking it covers the full circle.
    pub fn from_parts(
        bin_width_deg: f64,
        angles_deg: Vec<f64>,
        low_confidence: Vec<bool>,
        terrain_fingerprint: String,
        observer_height_m: f64,
    ) -> Result<Self, ComputationError> {
        let n = bin_count_for_width(bin_width_deg)?;
        if angles_deg.len() != n || low_confidence.len() != n {
            return Err(ComputationError::InvalidProfile(format!(
                "expected {} bins, got {} angles and {} flags",
                n,
                angles_deg.len(),
                low_confidence.len()
            )));
        }
        if angles_deg.iter().any(|a| !a.is_finite()) {
            return Err(ComputationError::InvalidProfile(
                "non-finite bin angle".to_string(),
            ));
        }
        Ok(Self {
            bin_width_deg,
            angles_deg,
            low_confidence,
            terrain_fingerprint,
            observer_height_m,
        })
    }

    pub fn bin_width_deg(&self) -> f64 {
        self.bin_width_deg
    }

    pub fn angles_deg(&self) -> &[f64] {
        &self.angles_deg
    }

    pub fn low_confidence(&self) -> &[bool] {
        &self.low_confidence
    }

    pub fn terrain_fingerprint(&self) -> &str {
        &self.terrain_fingerprint
    }

    pub fn observer_height_m(&self) -> f64 {
        self.observer_height_m
    }

    /// True if the profile was built for this observer height and terrain.
    pub fn is_current(&self, observer_height_m: f64, terrain_fingerprint: &str) -> bool {
        (self.observer_height_m - observer_height_m).abs() < 1e-6
            && self.terrain_fingerprint == terrain_fingerprint
    }

    /// Obstruction angle at `azimuth_deg`, linearly interpolated between the
    /// two neighbouring bin centres.
    pub fn gate_at(&self, azimuth_deg: f64) -> GateLookup {
        let n = self.angles_deg.len();
        let w = self.bin_width_deg;
        if !azimuth_deg.is_finite() {
            return GateLookup {
                angle_deg: self.angles_deg.iter().cloned().fold(NO_OBSTRUCTION_DEG, f64::max),
                low_confidence: self.low_confidence.iter().any(|&lc| lc),
            };
        }
        let pos = ((azimuth_deg - w / 2.0) / w).rem_euclid(n as f64);
        let base = pos.floor();
        let frac = pos - base;
        let i0 = (base as usize) % n;
        let i1 = (i0 + 1) % n;
        GateLookup {
            angle_deg: self.angles_deg[i0] * (1.0 - frac) + self.angles_deg[i1] * frac,
            low_confidence: self.low_confidence[i0] || self.low_confidence[i1],
        }
    }
}

/// Build a profile for an observer at (lat, lon, observer_height_m).
///
/// Each bin keeps the maximum `atan2(terrain − observer, distance)` along its
/// ray. A sample without coverage ends the ray and marks the bin
/// low-confidence; the angle accumulated so far is kept.
pub fn build_profile(
    terrain: &dyn ElevationSampler,
    lat: f64,
    lon: f64,
    observer_height_m: f64,
    params: &HorizonParams,
) -> Result<HorizonProfile, ComputationError> {
    let n = params.bin_count()?;
    if !lat.is_finite() || !lon.is_finite() || !observer_height_m.is_finite() {
        return Err(ComputationError::MalformedLocation(format!(
            "non-finite observer ({}, {}, {})",
            lat, lon, observer_height_m
        )));
    }
    if params.step_m.is_nan()
        || params.step_m <= 0.0
        || params.max_range_m.is_nan()
        || params.max_range_m <= 0.0
    {
        return Err(ComputationError::InvalidProfile(format!(
            "invalid ray step {} / range {}",
            params.step_m, params.max_range_m
        )));
    }

    let steps = (params.max_range_m / params.step_m).floor() as usize;
    let mut angles = Vec::with_capacity(n);
    let mut low_confidence = Vec::with_capacity(n);

    for i in 0..n {
        let azimuth = i as f64 * params.bin_width_deg + params.bin_width_deg / 2.0;
        let mut max_angle = NO_OBSTRUCTION_DEG;
        let mut truncated = false;
        for k in 1..=steps {
            let distance = k as f64 * params.step_m;
            let (plat, plon) = destination_point(lat, lon, azimuth, distance);
            match terrain.sample(plat, plon) {
                Some(h) => {
                    let angle = (h - observer_height_m).atan2(distance).to_degrees();
                    if angle > max_angle {
                        max_angle = angle;
                    }
                }
                None => {
                    truncated = true;
                    break;
                }
            }
        }
        angles.push(max_angle);
        low_confidence.push(truncated);
    }

    HorizonProfile::from_parts(
        params.bin_width_deg,
        angles,
        low_confidence,
        terrain.fingerprint(),
        observer_height_m,
    )
}
