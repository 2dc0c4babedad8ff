// Clima Agent -- Weather provider boundary
//
// The dispatcher only sees the `WeatherProvider` trait. `OpenMeteoClient` is
// the production implementation; tests script their own.

pub mod open_meteo;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use open_meteo::OpenMeteoClient;

// ── Models ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    Clear,
    PartlyCloudy,
    Cloudy,
    Fog,
    Drizzle,
    Rain,
    Snow,
    Thunderstorm,
    Unknown,
}

/// Map a WMO weather interpretation code to a coarse condition.
pub fn condition_for_code(code: i64) -> WeatherCondition {
    match code {
        0 => WeatherCondition::Clear,
        1 | 2 => WeatherCondition::PartlyCloudy,
        3 => WeatherCondition::Cloudy,
        45 | 48 => WeatherCondition::Fog,
        51 | 53 | 55 => WeatherCondition::Drizzle,
        61 | 63 | 65 => WeatherCondition::Rain,
        71 | 73 | 75 => WeatherCondition::Snow,
        95 | 96 | 99 => WeatherCondition::Thunderstorm,
        _ => WeatherCondition::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub observed_at: Option<String>,
    pub temperature: Option<f64>,
    pub apparent_temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub precipitation: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_gusts: Option<f64>,
    pub weather_code: Option<i64>,
    pub condition: WeatherCondition,
    pub is_day: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub date: String,
    pub temperature_max: Option<f64>,
    pub temperature_min: Option<f64>,
    pub precipitation_sum: Option<f64>,
    pub wind_speed_max: Option<f64>,
    pub weather_code: Option<i64>,
    pub condition: WeatherCondition,
}

// ── Validation ───────────────────────────────────────────────────────────────

static LOCATION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-ZáéíóúÁÉÍÓÚñÑüÜ\s\-\.',()]+$").unwrap());

/// Trim and validate a human-entered place name. Returns the trimmed name.
pub fn validate_location_name(raw: &str) -> Result<String, String> {
    let name = raw.trim();
    if name.chars().count() < 2 {
        return Err("location must be at least 2 characters long".to_string());
    }
    if !LOCATION_NAME.is_match(name) {
        return Err(format!("location contains unsupported characters: {name:?}"));
    }
    Ok(name.to_string())
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("weather service unreachable: {0}")]
    Transport(String),

    #[error("weather service timed out")]
    Timeout,

    #[error("weather service returned HTTP {status}")]
    Status { status: u16, body: String },

    #[error("weather service returned an unreadable response: {0}")]
    Decode(String),

    #[error("location not found: {0}")]
    LocationNotFound(String),
}

impl UpstreamError {
    /// Retryable failures say something about the upstream's health and count
    /// against its circuit breaker. The rest are caused by the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport(_) | UpstreamError::Timeout | UpstreamError::Decode(_) => true,
            UpstreamError::Status { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::LocationNotFound(_) => false,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_decode() {
            UpstreamError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::Status {
                status: status.as_u16(),
                body: String::new(),
            }
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

// ── Provider trait ───────────────────────────────────────────────────────────

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn search_locations(&self, query: &str, limit: u8) -> Result<Vec<Location>, UpstreamError>;

    async fn current_conditions(&self, location: &Location) -> Result<CurrentConditions, UpstreamError>;

    async fn daily_forecast(
        &self,
        location: &Location,
        days: u8,
    ) -> Result<Vec<DailyForecast>, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wmo_codes_map_to_conditions() {
        assert_eq!(condition_for_code(0), WeatherCondition::Clear);
        assert_eq!(condition_for_code(2), WeatherCondition::PartlyCloudy);
        assert_eq!(condition_for_code(48), WeatherCondition::Fog);
        assert_eq!(condition_for_code(63), WeatherCondition::Rain);
        assert_eq!(condition_for_code(99), WeatherCondition::Thunderstorm);
        assert_eq!(condition_for_code(80), WeatherCondition::Unknown);
    }

    #[test]
    fn location_names_are_trimmed_and_checked() {
        assert_eq!(validate_location_name("  Madrid ").unwrap(), "Madrid");
        assert!(validate_location_name("A Coruña").is_ok());
        assert!(validate_location_name("Łódź").is_err());
        assert!(validate_location_name("Washington, D.C.").is_ok());
        assert!(validate_location_name("x").is_err());
        assert!(validate_location_name("DROP TABLE; --").is_err());
    }

    #[test]
    fn retryable_classification() {
        assert!(UpstreamError::Timeout.is_retryable());
        assert!(UpstreamError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(UpstreamError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!UpstreamError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!UpstreamError::LocationNotFound("Atlantis".into()).is_retryable());
    }
}
