//! Open-Meteo hourly forecast client.
//!
//! Fetches `cloudcover` and `sunshine_duration` for a point.
//! See: https://open-meteo.com/en/docs

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::errors::AppError;
use crate::services::weather::{ForecastHour, ForecastSource};

/// Client for the Open-Meteo forecast API.
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
    forecast_hours: u32,
}

// --- Open-Meteo JSON response types ---

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: Option<OpenMeteoHourly>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    #[serde(default)]
    cloudcover: Vec<Option<f64>>,
    #[serde(default)]
    sunshine_duration: Vec<Option<f64>>,
}

impl OpenMeteoClient {
    pub fn new(base_url: &str, timeout_secs: u64, forecast_hours: u32) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            forecast_hours,
        })
    }

    /// Fetch hourly cloud cover for a location.
    pub async fn fetch_hourly(&self, lat: f64, lon: f64) -> Result<Vec<ForecastHour>, AppError> {
        let url = format!(
            "{}?latitude={:.4}&longitude={:.4}&hourly=cloudcover,sunshine_duration&forecast_hours={}&timezone=UTC",
            self.base_url, lat, lon, self.forecast_hours
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            AppError::ExternalServiceError(format!("Open-Meteo request failed: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(AppError::ExternalServiceError(format!(
                "Open-Meteo returned HTTP {}",
                response.status()
            )));
        }

        let raw_json: serde_json::Value = response.json().await.map_err(|e| {
            AppError::ExternalServiceError(format!("Open-Meteo JSON parse error: {}", e))
        })?;

        parse_hourly(&raw_json)
    }
}

#[async_trait]
impl ForecastSource for OpenMeteoClient {
    async fn fetch_forecast(&self, lat: f64, lon: f64) -> Result<Vec<ForecastHour>, AppError> {
        self.fetch_hourly(lat, lon).await
    }
}

/// Parse the `hourly` block of an Open-Meteo response.
///
/// Hours with a null cloud cover are skipped; a response without any usable
/// hour is an error so the cache keeps its previous data.
pub fn parse_hourly(raw_json: &serde_json::Value) -> Result<Vec<ForecastHour>, AppError> {
    let response: OpenMeteoResponse = serde_json::from_value(raw_json.clone()).map_err(|e| {
        AppError::ExternalServiceError(format!("Open-Meteo response structure error: {}", e))
    })?;

    let hourly = response.hourly.ok_or_else(|| {
        AppError::ExternalServiceError("Open-Meteo response has no hourly block".to_string())
    })?;

    let mut hours = Vec::with_capacity(hourly.time.len());
    for (i, time) in hourly.time.iter().enumerate() {
        let Some(hour) = parse_hour(time) else {
            tracing::warn!("Skipping Open-Meteo hour with invalid time '{}'", time);
            continue;
        };
        let Some(cloud) = hourly.cloudcover.get(i).copied().flatten() else {
            continue;
        };
        hours.push(ForecastHour {
            hour,
            cloud_cover_pct: cloud.clamp(0.0, 100.0),
            sunshine_seconds: hourly.sunshine_duration.get(i).copied().flatten(),
        });
    }

    if hours.is_empty() {
        return Err(AppError::ExternalServiceError(
            "Open-Meteo returned no usable hourly values".to_string(),
        ));
    }

    Ok(hours)
}

/// Open-Meteo times are local to the requested timezone (UTC here) without
/// an offset, e.g. "2024-06-21T10:00".
fn parse_hour(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .ok()
        .map(|dt| dt.and_utc())
        .or_else(|| s.parse::<DateTime<Utc>>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_body() -> serde_json::Value {
        serde_json::json!({
            "latitude": 47.06,
            "longitude": 15.44,
            "hourly_units": { "time": "iso8601", "cloudcover": "%", "sunshine_duration": "s" },
            "hourly": {
                "time": ["2024-06-21T10:00", "2024-06-21T11:00", "2024-06-21T12:00"],
                "cloudcover": [12, 35, null],
                "sunshine_duration": [3600.0, 1200.0, null]
            }
        })
    }

    #[test]
    fn test_parse_hourly() {
        let hours = parse_hourly(&sample_body()).unwrap();
        assert_eq!(hours.len(), 2);
        assert_eq!(
            hours[0].hour,
            "2024-06-21T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(hours[0].cloud_cover_pct, 12.0);
        assert_eq!(hours[1].cloud_cover_pct, 35.0);
        assert_eq!(hours[1].sunshine_seconds, Some(1200.0));
    }

    #[test]
    fn test_parse_hourly_missing_block() {
        let json = serde_json::json!({ "latitude": 47.0 });
        assert!(parse_hourly(&json).is_err());
    }

    #[test]
    fn test_parse_hourly_all_null() {
        let json = serde_json::json!({
            "hourly": { "time": ["2024-06-21T10:00"], "cloudcover": [null] }
        });
        assert!(parse_hourly(&json).is_err());
    }

    #[test]
    fn test_parse_hour_formats() {
        assert!(parse_hour("2024-06-21T10:00").is_some());
        assert!(parse_hour("2024-06-21T10:00:00Z").is_some());
        assert!(parse_hour("yesterday").is_none());
    }

    #[tokio::test]
    async fn test_fetch_hourly_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("hourly", "cloudcover,sunshine_duration"))
            .and(query_param("forecast_hours", "168"))
            .and(query_param("latitude", "47.0500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            OpenMeteoClient::new(&format!("{}/v1/forecast", server.uri()), 5, 168).unwrap();
        let hours = client.fetch_forecast(47.05, 15.45).await.unwrap();
        assert_eq!(hours.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_hourly_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), 5, 168).unwrap();
        let err = client.fetch_forecast(47.05, 15.45).await.unwrap_err();
        assert!(matches!(err, AppError::ExternalServiceError(_)));
    }

    #[tokio::test]
    async fn test_fetch_hourly_malformed_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), 5, 168).unwrap();
        assert!(client.fetch_forecast(47.05, 15.45).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_hourly_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(sample_body())
                    .set_delay(std::time::Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), 1, 168).unwrap();
        assert!(client.fetch_forecast(47.05, 15.45).await.is_err());
    }
}
