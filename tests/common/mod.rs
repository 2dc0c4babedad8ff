// Clima Agent -- shared integration test fixtures
//
// A scripted in-memory weather provider and helpers to build a dispatcher
// and router around it without touching the network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use clima_agent::config::AgentConfig;
use clima_agent::dispatcher::Dispatcher;
use clima_agent::reasoner::{PlannedCall, Reasoner, ReasonerError, ToolDeclaration};
use clima_agent::state::AppState;
use clima_agent::weather::{
    CurrentConditions, DailyForecast, Location, UpstreamError, WeatherCondition, WeatherProvider,
};

fn place(name: &str, lat: f64, lon: f64, country: &str, region: Option<&str>) -> Location {
    Location {
        name: name.to_string(),
        latitude: lat,
        longitude: lon,
        country: Some(country.to_string()),
        region: region.map(str::to_string),
        timezone: Some("Europe/Madrid".to_string()),
        elevation: None,
    }
}

fn gazetteer() -> Vec<Location> {
    vec![
        place("Madrid", 40.4165, -3.70256, "España", Some("Comunidad de Madrid")),
        place("Barcelona", 41.38879, 2.15899, "España", Some("Cataluña")),
        place("Barcelona", 10.13625, -64.68618, "Venezuela", Some("Anzoátegui")),
        place("Barcelona", 12.86917, 124.14167, "Filipinas", None),
        place("Barcelona", -5.94889, -35.92694, "Brasil", None),
        place("Barceloneta", 18.4505, -66.5385, "Puerto Rico", None),
        place("Valencia", 39.46975, -0.37739, "España", Some("Comunidad Valenciana")),
        place("Sevilla", 37.38283, -5.97317, "España", Some("Andalucía")),
    ]
}

/// In-memory provider. Every trait call is counted as one upstream call.
pub struct FakeWeather {
    places: Vec<Location>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl Default for FakeWeather {
    fn default() -> Self {
        Self {
            places: gazetteer(),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl FakeWeather {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every call fail with a retryable transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn enter(&self) -> Result<(), UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WeatherProvider for FakeWeather {
    async fn search_locations(&self, query: &str, limit: u8) -> Result<Vec<Location>, UpstreamError> {
        self.enter().await?;
        let q = query.to_lowercase();
        Ok(self
            .places
            .iter()
            .filter(|p| p.name.to_lowercase().starts_with(&q))
            .take(usize::from(limit))
            .cloned()
            .collect())
    }

    async fn current_conditions(&self, location: &Location) -> Result<CurrentConditions, UpstreamError> {
        self.enter().await?;
        Ok(CurrentConditions {
            observed_at: Some("2026-10-16T12:00".to_string()),
            temperature: Some(if location.name == "Madrid" { 22.5 } else { 19.0 }),
            apparent_temperature: Some(21.8),
            humidity: Some(45.0),
            precipitation: Some(0.0),
            cloud_cover: Some(10.0),
            pressure: Some(1016.2),
            wind_speed: Some(12.3),
            wind_direction: Some(270.0),
            wind_gusts: Some(25.1),
            weather_code: Some(0),
            condition: WeatherCondition::Clear,
            is_day: Some(true),
        })
    }

    async fn daily_forecast(&self, _location: &Location, days: u8) -> Result<Vec<DailyForecast>, UpstreamError> {
        self.enter().await?;
        Ok((0..days)
            .map(|i| DailyForecast {
                date: format!("2026-10-{:02}", 16 + u32::from(i)),
                temperature_max: Some(25.0),
                temperature_min: Some(14.0),
                precipitation_sum: Some(0.0),
                wind_speed_max: Some(18.0),
                weather_code: Some(1),
                condition: WeatherCondition::PartlyCloudy,
            })
            .collect())
    }
}

/// Reasoner that always plans the same call.
pub struct FixedPlan(pub PlannedCall);

#[async_trait]
impl Reasoner for FixedPlan {
    async fn plan(&self, _query: &str, tools: &[ToolDeclaration]) -> Result<PlannedCall, ReasonerError> {
        assert!(tools.iter().all(|t| t.name != "process_query"));
        Ok(self.0.clone())
    }
}

pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.rate_limit.per_window = 1000;
    config.rate_limit.burst = 0;
    config
}

pub fn dispatcher_with(config: &AgentConfig, weather: Arc<FakeWeather>) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::from_config(config, weather, None).unwrap())
}

pub fn dispatcher_with_reasoner(
    config: &AgentConfig,
    weather: Arc<FakeWeather>,
    reasoner: Arc<dyn Reasoner>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::from_config(config, weather, Some(reasoner)).unwrap())
}

pub fn app_state(config: AgentConfig, weather: Arc<FakeWeather>) -> AppState {
    let dispatcher = dispatcher_with(&config, weather);
    AppState::new(Arc::new(config), dispatcher)
}

pub fn request(method: &str, params: Value, id: u64) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": id })
}
