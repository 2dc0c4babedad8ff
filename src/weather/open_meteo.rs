// Clima Agent -- Open-Meteo client
//
// Geocoding + forecast endpoints. No API key. Responses are decoded into
// the provider-neutral models of `weather`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{
    CurrentConditions, DailyForecast, Location, UpstreamError, WeatherProvider, condition_for_code,
};
use crate::config::WeatherApiConfig;

/// Hard upper bound of the forecast endpoint.
pub const MAX_FORECAST_DAYS: u8 = 16;

const CURRENT_VARIABLES: &str = "temperature_2m,relative_humidity_2m,apparent_temperature,is_day,\
precipitation,rain,showers,snowfall,weather_code,cloud_cover,pressure_msl,surface_pressure,\
wind_speed_10m,wind_direction_10m,wind_gusts_10m";

const DAILY_VARIABLES: &str =
    "temperature_2m_max,temperature_2m_min,precipitation_sum,wind_speed_10m_max,weather_code";

const UNIT_PARAMS: [(&str, &str); 5] = [
    ("temperature_unit", "celsius"),
    ("wind_speed_unit", "kmh"),
    ("precipitation_unit", "mm"),
    ("timeformat", "iso8601"),
    ("timezone", "auto"),
];

/// Kept short; Open-Meteo echoes the request on 4xx and that is all we need.
const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct OpenMeteoClient {
    client: Client,
    forecast_url: String,
    geocoding_url: String,
}

impl OpenMeteoClient {
    pub fn new(config: &WeatherApiConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("clima-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &WeatherApiConfig) -> Self {
        Self {
            client,
            forecast_url: format!("{}/forecast", config.base_url.trim_end_matches('/')),
            geocoding_url: config.geocoding_url.clone(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let started = std::time::Instant::now();
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            truncate_utf8(&mut body, MAX_ERROR_BODY);
            tracing::warn!(url, status = status.as_u16(), "open_meteo: request rejected");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await?;
        tracing::debug!(
            url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "open_meteo: response received"
        );
        serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    fn forecast_query(location: &Location) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("latitude", location.latitude.to_string()),
            ("longitude", location.longitude.to_string()),
        ];
        query.extend(UNIT_PARAMS.iter().map(|(k, v)| (*k, v.to_string())));
        query
    }
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

// ── Wire models ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<GeocodingResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodingResult {
    name: String,
    latitude: f64,
    longitude: f64,
    country: Option<String>,
    admin1: Option<String>,
    timezone: Option<String>,
    elevation: Option<f64>,
}

impl From<GeocodingResult> for Location {
    fn from(r: GeocodingResult) -> Self {
        Location {
            name: r.name,
            latitude: r.latitude,
            longitude: r.longitude,
            country: r.country,
            region: r.admin1,
            timezone: r.timezone,
            elevation: r.elevation,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    current: CurrentBlock,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    time: Option<String>,
    temperature_2m: Option<f64>,
    apparent_temperature: Option<f64>,
    relative_humidity_2m: Option<f64>,
    precipitation: Option<f64>,
    cloud_cover: Option<f64>,
    pressure_msl: Option<f64>,
    wind_speed_10m: Option<f64>,
    wind_direction_10m: Option<f64>,
    wind_gusts_10m: Option<f64>,
    weather_code: Option<i64>,
    is_day: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    daily: DailyBlock,
}

#[derive(Debug, Deserialize)]
struct DailyBlock {
    time: Vec<String>,
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_sum: Vec<Option<f64>>,
    #[serde(default)]
    wind_speed_10m_max: Vec<Option<f64>>,
    #[serde(default)]
    weather_code: Vec<Option<i64>>,
}

fn column<T: Copy>(values: &[Option<T>], i: usize) -> Option<T> {
    values.get(i).copied().flatten()
}

impl DailyBlock {
    fn into_days(self) -> Vec<DailyForecast> {
        self.time
            .iter()
            .enumerate()
            .map(|(i, date)| {
                let weather_code = column(&self.weather_code, i);
                DailyForecast {
                    date: date.clone(),
                    temperature_max: column(&self.temperature_2m_max, i),
                    temperature_min: column(&self.temperature_2m_min, i),
                    precipitation_sum: column(&self.precipitation_sum, i),
                    wind_speed_max: column(&self.wind_speed_10m_max, i),
                    weather_code,
                    condition: condition_for_code(weather_code.unwrap_or(-1)),
                }
            })
            .collect()
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    async fn search_locations(&self, query: &str, limit: u8) -> Result<Vec<Location>, UpstreamError> {
        let params = [
            ("name", query.to_string()),
            ("count", limit.to_string()),
            ("language", "es".to_string()),
            ("format", "json".to_string()),
        ];
        let resp: GeocodingResponse = self.get_json(&self.geocoding_url, &params).await?;
        Ok(resp
            .results
            .into_iter()
            .take(usize::from(limit))
            .map(Location::from)
            .collect())
    }

    async fn current_conditions(&self, location: &Location) -> Result<CurrentConditions, UpstreamError> {
        let mut params = Self::forecast_query(location);
        params.push(("current", CURRENT_VARIABLES.to_string()));
        let resp: CurrentResponse = self.get_json(&self.forecast_url, &params).await?;
        let c = resp.current;
        Ok(CurrentConditions {
            observed_at: c.time,
            temperature: c.temperature_2m,
            apparent_temperature: c.apparent_temperature,
            humidity: c.relative_humidity_2m,
            precipitation: c.precipitation,
            cloud_cover: c.cloud_cover,
            pressure: c.pressure_msl,
            wind_speed: c.wind_speed_10m,
            wind_direction: c.wind_direction_10m,
            wind_gusts: c.wind_gusts_10m,
            weather_code: c.weather_code,
            condition: condition_for_code(c.weather_code.unwrap_or(-1)),
            is_day: c.is_day.map(|d| d == 1),
        })
    }

    async fn daily_forecast(
        &self,
        location: &Location,
        days: u8,
    ) -> Result<Vec<DailyForecast>, UpstreamError> {
        let mut params = Self::forecast_query(location);
        params.push(("daily", DAILY_VARIABLES.to_string()));
        params.push(("forecast_days", days.clamp(1, MAX_FORECAST_DAYS).to_string()));
        let resp: DailyResponse = self.get_json(&self.forecast_url, &params).await?;
        Ok(resp.daily.into_days())
    }
}
