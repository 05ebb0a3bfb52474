use crate::errors::AppError;

pub mod health;
pub mod locations;
pub mod regeneration;
pub mod weather;

/// Reject coordinates outside the WGS84 range.
pub(crate) fn validate_point(lat: f64, lon: f64) -> Result<(), AppError> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(AppError::BadRequest("lat must be between -90 and 90".to_string()));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(AppError::BadRequest("lon must be between -180 and 180".to_string()));
    }
    Ok(())
}
