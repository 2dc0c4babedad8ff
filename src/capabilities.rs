// Clima Agent -- Capability registry
//
// Static table of every JSON-RPC method the agent answers, built once at
// startup. Protocol built-ins and weather capabilities share one namespace
// so lookup is a single map access.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::CacheConfig;
use crate::weather::{self, UpstreamError, WeatherProvider};

// ── Method kinds ─────────────────────────────────────────────────────────────

/// Upstream resource guarded by a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    OpenMeteo,
    Reasoner,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::OpenMeteo => "open_meteo",
            Resource::Reasoner => "reasoner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    GetCapabilities,
    GetAgentInfo,
    SubmitTask,
    GetTaskStatus,
    CancelTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    CurrentWeather,
    Forecast,
    SearchLocations,
    ProcessQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Builtin(Builtin),
    Capability(CapabilityKind),
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityExample {
    pub input: Value,
    pub output: Value,
}

#[derive(Debug, Clone)]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: MethodKind,
    pub input_schema: Value,
    pub output_schema: Value,
    pub examples: Vec<CapabilityExample>,
    pub is_async_eligible: bool,
    pub resource: Option<Resource>,
    /// `Some` for cacheable capabilities.
    pub cache_ttl: Option<Duration>,
}

impl CapabilitySpec {
    pub fn is_builtin(&self) -> bool {
        matches!(self.kind, MethodKind::Builtin(_))
    }

    fn builtin(name: &'static str, description: &'static str, builtin: Builtin) -> Self {
        Self {
            name,
            description,
            kind: MethodKind::Builtin(builtin),
            input_schema: json!({"type": "object"}),
            output_schema: json!({"type": "object"}),
            examples: Vec::new(),
            is_async_eligible: false,
            resource: None,
            cache_ttl: None,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("method '{0}' registered twice")]
    Duplicate(&'static str),
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    methods: HashMap<&'static str, CapabilitySpec>,
    order: Vec<&'static str>,
}

impl RegistryBuilder {
    pub fn register(mut self, spec: CapabilitySpec) -> Result<Self, RegistryError> {
        if self.methods.contains_key(spec.name) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        self.order.push(spec.name);
        self.methods.insert(spec.name, spec);
        Ok(self)
    }

    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            methods: self.methods,
            order: self.order,
        }
    }
}

/// Read-only after construction.
#[derive(Debug)]
pub struct CapabilityRegistry {
    methods: HashMap<&'static str, CapabilitySpec>,
    order: Vec<&'static str>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Built-ins, the three weather capabilities and, when a reasoner is
    /// configured, `process_query`.
    pub fn standard(ttls: &CacheConfig, with_reasoner: bool) -> Result<Self, RegistryError> {
        let mut builder = Self::builder()
            .register(CapabilitySpec::builtin(
                "get_capabilities",
                "List the capabilities this agent offers",
                Builtin::GetCapabilities,
            ))?
            .register(CapabilitySpec::builtin(
                "get_agent_info",
                "Describe this agent",
                Builtin::GetAgentInfo,
            ))?
            .register(CapabilitySpec::builtin(
                "submit_task",
                "Run a capability asynchronously and return a task id",
                Builtin::SubmitTask,
            ))?
            .register(CapabilitySpec::builtin(
                "get_task_status",
                "Fetch the current snapshot of a task",
                Builtin::GetTaskStatus,
            ))?
            .register(CapabilitySpec::builtin(
                "cancel_task",
                "Cancel a task that has not finished",
                Builtin::CancelTask,
            ))?
            .register(current_weather_spec(ttls.ttl_current))?
            .register(forecast_spec(ttls.ttl_forecast))?
            .register(search_locations_spec(ttls.ttl_search))?;
        if with_reasoner {
            builder = builder.register(process_query_spec())?;
        }
        Ok(builder.build())
    }

    pub fn lookup(&self, method: &str) -> Option<&CapabilitySpec> {
        self.methods.get(method)
    }

    /// Every registered method name, in registration order.
    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.order.iter().copied()
    }

    /// Non-builtin capabilities, in registration order.
    pub fn capabilities(&self) -> impl Iterator<Item = &CapabilitySpec> + '_ {
        self.order
            .iter()
            .filter_map(|name| self.methods.get(name))
            .filter(|spec| !spec.is_builtin())
    }

    pub fn resources(&self) -> Vec<Resource> {
        let mut out: Vec<Resource> = Vec::new();
        for spec in self.capabilities() {
            if let Some(r) = spec.resource
                && !out.contains(&r)
            {
                out.push(r);
            }
        }
        out
    }
}

fn location_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "latitude": {"type": "number"},
            "longitude": {"type": "number"},
            "country": {"type": "string"},
            "region": {"type": "string"},
            "timezone": {"type": "string"},
            "elevation": {"type": "number"}
        },
        "required": ["name", "latitude", "longitude"]
    })
}

fn current_weather_spec(ttl: Duration) -> CapabilitySpec {
    CapabilitySpec {
        name: "get_current_weather",
        description: "Current weather conditions for a city",
        kind: MethodKind::Capability(CapabilityKind::CurrentWeather),
        input_schema: json!({
            "type": "object",
            "properties": {
                "location": {"type": "string", "minLength": 2, "description": "City name, e.g. \"Madrid\""}
            },
            "required": ["location"]
        }),
        output_schema: json!({
            "type": "object",
            "properties": {
                "location": location_schema(),
                "current_weather": {"type": "object"},
                "status": {"type": "string"},
                "source": {"type": "string"}
            },
            "required": ["location", "current_weather"]
        }),
        examples: vec![CapabilityExample {
            input: json!({"location": "Madrid"}),
            output: json!({
                "location": {"name": "Madrid", "latitude": 40.4165, "longitude": -3.70256, "country": "España"},
                "current_weather": {"temperature": 22.5, "humidity": 45.0, "condition": "clear"},
                "status": "success",
                "source": "Open-Meteo"
            }),
        }],
        is_async_eligible: true,
        resource: Some(Resource::OpenMeteo),
        cache_ttl: Some(ttl),
    }
}

fn forecast_spec(ttl: Duration) -> CapabilitySpec {
    CapabilitySpec {
        name: "get_forecast",
        description: "Daily weather forecast for a city (1 to 16 days)",
        kind: MethodKind::Capability(CapabilityKind::Forecast),
        input_schema: json!({
            "type": "object",
            "properties": {
                "location": {"type": "string", "minLength": 2},
                "days": {"type": "integer", "minimum": 1, "maximum": 16, "default": DEFAULT_FORECAST_DAYS}
            },
            "required": ["location"]
        }),
        output_schema: json!({
            "type": "object",
            "properties": {
                "location": location_schema(),
                "forecast": {"type": "array", "items": {"type": "object"}},
                "days": {"type": "integer"},
                "status": {"type": "string"},
                "source": {"type": "string"}
            },
            "required": ["location", "forecast"]
        }),
        examples: vec![CapabilityExample {
            input: json!({"location": "Sevilla", "days": 3}),
            output: json!({
                "location": {"name": "Sevilla", "latitude": 37.38283, "longitude": -5.97317},
                "forecast": [{"date": "2026-10-16", "temperature_max": 27.1, "temperature_min": 15.2, "condition": "clear"}],
                "days": 3,
                "status": "success",
                "source": "Open-Meteo"
            }),
        }],
        is_async_eligible: true,
        resource: Some(Resource::OpenMeteo),
        cache_ttl: Some(ttl),
    }
}

fn search_locations_spec(ttl: Duration) -> CapabilitySpec {
    CapabilitySpec {
        name: "search_locations",
        description: "Find places matching a name",
        kind: MethodKind::Capability(CapabilityKind::SearchLocations),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "minLength": 2},
                "limit": {"type": "integer", "minimum": 1, "maximum": 20, "default": DEFAULT_SEARCH_LIMIT}
            },
            "required": ["query"]
        }),
        output_schema: json!({
            "type": "object",
            "properties": {
                "locations": {"type": "array", "items": location_schema()},
                "count": {"type": "integer"},
                "status": {"type": "string"}
            },
            "required": ["locations", "count"]
        }),
        examples: vec![CapabilityExample {
            input: json!({"query": "Barcelona", "limit": 3}),
            output: json!({
                "locations": [{"name": "Barcelona", "latitude": 41.38879, "longitude": 2.15899, "country": "España", "region": "Cataluña"}],
                "count": 1,
                "status": "success"
            }),
        }],
        is_async_eligible: true,
        resource: Some(Resource::OpenMeteo),
        cache_ttl: Some(ttl),
    }
}

fn process_query_spec() -> CapabilitySpec {
    CapabilitySpec {
        name: "process_query",
        description: "Answer a free-text weather question by planning and running one capability",
        kind: MethodKind::Capability(CapabilityKind::ProcessQuery),
        input_schema: json!({
            "type": "object",
            "properties": {"query": {"type": "string", "minLength": 1}},
            "required": ["query"]
        }),
        output_schema: json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "plan": {"type": "object"},
                "result": {"type": "object"}
            },
            "required": ["query", "plan", "result"]
        }),
        examples: vec![CapabilityExample {
            input: json!({"query": "¿Qué tiempo hace en Valencia?"}),
            output: json!({
                "query": "¿Qué tiempo hace en Valencia?",
                "plan": {"capability": "get_current_weather", "params": {"location": "Valencia"}},
                "result": {"status": "success"}
            }),
        }],
        is_async_eligible: true,
        resource: Some(Resource::Reasoner),
        cache_ttl: None,
    }
}

// ── Typed params ─────────────────────────────────────────────────────────────

pub const DEFAULT_FORECAST_DAYS: u8 = 7;
pub const DEFAULT_SEARCH_LIMIT: u8 = 5;
pub const MAX_SEARCH_LIMIT: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InvalidParams(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeatherParams {
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastParams {
    pub location: String,
    #[serde(default = "default_days")]
    pub days: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchLocationsParams {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessQueryParams {
    pub query: String,
}

fn default_days() -> u8 {
    DEFAULT_FORECAST_DAYS
}

fn default_limit() -> u8 {
    DEFAULT_SEARCH_LIMIT
}

/// A call against the weather provider, with validated and normalized params.
#[derive(Debug, Clone, PartialEq)]
pub enum WeatherCall {
    Current(CurrentWeatherParams),
    Forecast(ForecastParams),
    Search(SearchLocationsParams),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityCall {
    Weather(WeatherCall),
    ProcessQuery(ProcessQueryParams),
}

/// Decode a params object; `null` is treated as `{}`.
pub(crate) fn decode_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, InvalidParams> {
    let params = match params {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|e| InvalidParams(e.to_string()))
}

impl CapabilityCall {
    /// Decode, validate and normalize params for `kind`.
    pub fn parse(kind: CapabilityKind, params: &Value) -> Result<Self, InvalidParams> {
        let call = match kind {
            CapabilityKind::CurrentWeather => {
                let mut p: CurrentWeatherParams = decode_params(params)?;
                p.location = weather::validate_location_name(&p.location).map_err(InvalidParams)?;
                CapabilityCall::Weather(WeatherCall::Current(p))
            }
            CapabilityKind::Forecast => {
                let mut p: ForecastParams = decode_params(params)?;
                p.location = weather::validate_location_name(&p.location).map_err(InvalidParams)?;
                if !(1..=weather::open_meteo::MAX_FORECAST_DAYS).contains(&p.days) {
                    return Err(InvalidParams(format!(
                        "days must be between 1 and {}",
                        weather::open_meteo::MAX_FORECAST_DAYS
                    )));
                }
                CapabilityCall::Weather(WeatherCall::Forecast(p))
            }
            CapabilityKind::SearchLocations => {
                let mut p: SearchLocationsParams = decode_params(params)?;
                p.query = weather::validate_location_name(&p.query).map_err(InvalidParams)?;
                if !(1..=MAX_SEARCH_LIMIT).contains(&p.limit) {
                    return Err(InvalidParams(format!(
                        "limit must be between 1 and {MAX_SEARCH_LIMIT}"
                    )));
                }
                CapabilityCall::Weather(WeatherCall::Search(p))
            }
            CapabilityKind::ProcessQuery => {
                let mut p: ProcessQueryParams = decode_params(params)?;
                p.query = p.query.trim().to_string();
                if p.query.is_empty() {
                    return Err(InvalidParams("query must not be empty".to_string()));
                }
                CapabilityCall::ProcessQuery(p)
            }
        };
        Ok(call)
    }

    /// Params after normalization; this is what gets hashed and stored.
    pub fn normalized_params(&self) -> Value {
        match self {
            CapabilityCall::Weather(call) => call.normalized_params(),
            CapabilityCall::ProcessQuery(p) => json!({"query": p.query}),
        }
    }
}

impl WeatherCall {
    pub fn normalized_params(&self) -> Value {
        match self {
            WeatherCall::Current(p) => json!({"location": p.location}),
            WeatherCall::Forecast(p) => json!({"location": p.location, "days": p.days}),
            WeatherCall::Search(p) => json!({"query": p.query, "limit": p.limit}),
        }
    }

    /// Run against the provider and shape the capability result.
    pub async fn invoke(&self, provider: &dyn WeatherProvider) -> Result<Value, UpstreamError> {
        let generated_at = || chrono::Utc::now().to_rfc3339();
        match self {
            WeatherCall::Current(p) => {
                let location = resolve_location(provider, &p.location).await?;
                let current = provider.current_conditions(&location).await?;
                Ok(json!({
                    "location": location,
                    "current_weather": current,
                    "status": "success",
                    "source": "Open-Meteo",
                    "generated_at": generated_at(),
                }))
            }
            WeatherCall::Forecast(p) => {
                let location = resolve_location(provider, &p.location).await?;
                let mut forecast = provider.daily_forecast(&location, p.days).await?;
                forecast.truncate(usize::from(p.days));
                Ok(json!({
                    "location": location,
                    "forecast": forecast,
                    "days": forecast.len(),
                    "status": "success",
                    "source": "Open-Meteo",
                    "generated_at": generated_at(),
                }))
            }
            WeatherCall::Search(p) => {
                let mut locations = provider.search_locations(&p.query, p.limit).await?;
                locations.truncate(usize::from(p.limit));
                Ok(json!({
                    "locations": locations,
                    "count": locations.len(),
                    "status": "success",
                }))
            }
        }
    }
}

async fn resolve_location(
    provider: &dyn WeatherProvider,
    name: &str,
) -> Result<weather::Location, UpstreamError> {
    provider
        .search_locations(name, 1)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| UpstreamError::LocationNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttls() -> CacheConfig {
        CacheConfig {
            capacity: 10,
            ttl_current: Duration::from_secs(300),
            ttl_forecast: Duration::from_secs(1800),
            ttl_search: Duration::from_secs(3600),
        }
    }

    #[test]
    fn standard_registry_has_builtins_and_weather() {
        let reg = CapabilityRegistry::standard(&ttls(), false).unwrap();
        assert!(reg.lookup("submit_task").unwrap().is_builtin());
        let current = reg.lookup("get_current_weather").unwrap();
        assert_eq!(current.resource, Some(Resource::OpenMeteo));
        assert_eq!(current.cache_ttl, Some(Duration::from_secs(300)));
        assert!(reg.lookup("process_query").is_none());

        let names: Vec<_> = reg.capabilities().map(|c| c.name).collect();
        assert_eq!(names, vec!["get_current_weather", "get_forecast", "search_locations"]);
        assert_eq!(reg.resources(), vec![Resource::OpenMeteo]);
    }

    #[test]
    fn reasoner_adds_process_query() {
        let reg = CapabilityRegistry::standard(&ttls(), true).unwrap();
        let spec = reg.lookup("process_query").unwrap();
        assert_eq!(spec.resource, Some(Resource::Reasoner));
        assert!(spec.cache_ttl.is_none());
        assert_eq!(reg.resources(), vec![Resource::OpenMeteo, Resource::Reasoner]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let err = CapabilityRegistry::builder()
            .register(search_locations_spec(Duration::from_secs(1)))
            .unwrap()
            .register(search_locations_spec(Duration::from_secs(2)))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("search_locations"));
    }

    #[test]
    fn params_are_normalized_with_defaults() {
        let call = CapabilityCall::parse(CapabilityKind::Forecast, &json!({"location": "  Madrid "}))
            .unwrap();
        assert_eq!(call.normalized_params(), json!({"location": "Madrid", "days": 7}));

        let call = CapabilityCall::parse(CapabilityKind::SearchLocations, &json!({"query": "Barcelona"}))
            .unwrap();
        assert_eq!(call.normalized_params(), json!({"query": "Barcelona", "limit": 5}));
    }

    #[test]
    fn out_of_range_and_missing_params_are_invalid() {
        assert!(CapabilityCall::parse(CapabilityKind::Forecast, &json!({"location": "Madrid", "days": 0})).is_err());
        assert!(CapabilityCall::parse(CapabilityKind::Forecast, &json!({"location": "Madrid", "days": 17})).is_err());
        assert!(CapabilityCall::parse(CapabilityKind::SearchLocations, &json!({"query": "Roma", "limit": 21})).is_err());
        assert!(CapabilityCall::parse(CapabilityKind::SearchLocations, &json!({"query": "Roma", "limit": -1})).is_err());
        assert!(CapabilityCall::parse(CapabilityKind::CurrentWeather, &json!({})).is_err());
        assert!(CapabilityCall::parse(CapabilityKind::CurrentWeather, &json!({"location": "<script>"})).is_err());
        assert!(CapabilityCall::parse(CapabilityKind::ProcessQuery, &json!({"query": "   "})).is_err());
    }
}
