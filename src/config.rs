use std::fmt::Display;
use std::str::FromStr;

use crate::services::engine::EngineConfig;
use crate::services::horizon::HorizonParams;
use crate::services::near_field::{NearFieldParams, NoDataPolicy};
use crate::services::weather::{MissingForecastPolicy, WeatherConfig};

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    /// Directory containing OSM exports for location import.
    pub data_dir: String,
    pub terrain_raster_path: String,
    pub surface_raster_path: String,
    /// Observer eye height above ground (metres).
    pub observer_offset_m: f64,
    pub regenerate_on_startup: bool,
    pub regeneration_interval_hours: u32,
    pub engine: EngineConfig,
    pub weather: WeatherConfig,
}

/// Parse `raw` or fall back to `default` when unset. Invalid values abort
/// startup.
fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{} has an invalid value '{}': {}", key, v, e)),
        _ => default,
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    parse_or(key, std::env::var(key).ok(), default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let engine_defaults = EngineConfig::default();
        let weather_defaults = WeatherConfig::default();

        let parallelism: usize = env_or("ENGINE_PARALLELISM", engine_defaults.parallelism);
        let batch_size: Option<usize> = std::env::var("ENGINE_BATCH_SIZE")
            .ok()
            .map(|v| parse_or("ENGINE_BATCH_SIZE", Some(v), 0usize))
            .filter(|&b| b > 0);

        let engine = EngineConfig {
            city_lat: env_or("CITY_LATITUDE", engine_defaults.city_lat),
            city_lon: env_or("CITY_LONGITUDE", engine_defaults.city_lon),
            cadence_minutes: env_or("CADENCE_MINUTES", engine_defaults.cadence_minutes),
            window_hours: env_or("WINDOW_HOURS", engine_defaults.window_hours),
            retention_days: env_or("RETENTION_DAYS", engine_defaults.retention_days),
            parallelism: parallelism.max(1),
            batch_size,
            no_data_policy: env_or::<NoDataPolicy>("NO_DATA_POLICY", NoDataPolicy::Unknown),
            horizon: HorizonParams::default(),
            near_field: NearFieldParams::default(),
        };

        let weather = WeatherConfig {
            api_url: std::env::var("FORECAST_API_URL").unwrap_or(weather_defaults.api_url),
            timeout_secs: env_or("FORECAST_TIMEOUT_SECS", weather_defaults.timeout_secs),
            refresh_interval_secs: env_or("WEATHER_REFRESH_SECS", weather_defaults.refresh_interval_secs),
            ttl_secs: env_or("WEATHER_TTL_SECS", weather_defaults.ttl_secs),
            horizon_hours: env_or("WEATHER_HORIZON_HOURS", weather_defaults.horizon_hours),
            cloud_cover_threshold_pct: env_or(
                "CLOUD_COVER_THRESHOLD",
                weather_defaults.cloud_cover_threshold_pct,
            ),
            missing_policy: env_or::<MissingForecastPolicy>(
                "MISSING_FORECAST_POLICY",
                MissingForecastPolicy::Unknown,
            ),
            region_cell_deg: env_or("REGION_CELL_DEG", weather_defaults.region_cell_deg),
        };

        Self {
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            port: env_or("PORT", 8080u16),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            terrain_raster_path: std::env::var("TERRAIN_RASTER_PATH")
                .unwrap_or_else(|_| "./data/terrain.asc".to_string()),
            surface_raster_path: std::env::var("SURFACE_RASTER_PATH")
                .unwrap_or_else(|_| "./data/surface.asc".to_string()),
            observer_offset_m: env_or("OBSERVER_OFFSET_M", 1.2),
            regenerate_on_startup: env_or("REGENERATE_ON_STARTUP", true),
            regeneration_interval_hours: env_or("REGENERATION_INTERVAL_HOURS", 24u32).max(1),
            engine,
            weather,
        }
    }
}
