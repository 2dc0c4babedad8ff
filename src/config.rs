// Clima Agent -- Configuration
//
// Everything tunable is read from the environment once at startup
// (after `dotenvy::dotenv()` in main). Every variable has a default.

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WEATHER_API_BASE_URL: &str = "https://api.open-meteo.com/v1";
pub const DEFAULT_GEOCODING_API_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub agent_id: String,
    pub agent_name: String,
    pub public_url: String,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub tasks: TaskConfig,
    pub weather: WeatherApiConfig,
    /// `None` when `OPENAI_API_KEY` is unset; `process_query` is then not registered.
    pub reasoner: Option<ReasonerConfig>,
    pub enable_cors: bool,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_window: u32,
    pub burst: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_current: Duration,
    pub ttl_forecast: Duration,
    pub ttl_search: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    pub workers: usize,
    pub default_timeout: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub shutdown_drain: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeatherApiConfig {
    pub base_url: String,
    pub geocoding_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonerConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            agent_id: "weather-agent-001".to_string(),
            agent_name: "Weather Agent".to_string(),
            public_url: "http://localhost:8001".to_string(),
            rate_limit: RateLimitConfig {
                per_window: 60,
                burst: 10,
                window: Duration::from_secs(60),
            },
            cache: CacheConfig {
                capacity: 1000,
                ttl_current: Duration::from_secs(300),
                ttl_forecast: Duration::from_secs(1800),
                ttl_search: Duration::from_secs(3600),
            },
            breaker: BreakerConfig {
                failure_threshold: 5,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(60),
            },
            tasks: TaskConfig {
                workers: 4,
                default_timeout: Duration::from_secs(120),
                retention: Duration::from_secs(86_400),
                sweep_interval: Duration::from_secs(30),
                shutdown_drain: Duration::from_secs(30),
            },
            weather: WeatherApiConfig {
                base_url: DEFAULT_WEATHER_API_BASE_URL.to_string(),
                geocoding_url: DEFAULT_GEOCODING_API_URL.to_string(),
                timeout: Duration::from_secs(30),
            },
            reasoner: None,
            enable_cors: true,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl AgentConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`AgentConfig::from_env`] but with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let env = Env { lookup: &lookup };

        let reasoner = env.string("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()).map(|api_key| {
            ReasonerConfig {
                api_key,
                model: env.string("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                base_url: env
                    .string("OPENAI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            }
        });

        let config = Self {
            host: env.string("HOST").unwrap_or(d.host),
            port: env.parse("PORT", d.port)?,
            agent_id: env.string("AGENT_ID").unwrap_or(d.agent_id),
            agent_name: env.string("AGENT_NAME").unwrap_or(d.agent_name),
            public_url: env.string("PUBLIC_URL").unwrap_or(d.public_url),
            rate_limit: RateLimitConfig {
                per_window: env.parse("RATE_LIMIT_PER_WINDOW", d.rate_limit.per_window)?,
                burst: env.parse("RATE_LIMIT_BURST", d.rate_limit.burst)?,
                window: env.secs("RATE_LIMIT_WINDOW_SECS", d.rate_limit.window)?,
            },
            cache: CacheConfig {
                capacity: env.parse("CACHE_CAPACITY", d.cache.capacity)?,
                ttl_current: env.secs("CACHE_TTL_CURRENT_SECS", d.cache.ttl_current)?,
                ttl_forecast: env.secs("CACHE_TTL_FORECAST_SECS", d.cache.ttl_forecast)?,
                ttl_search: env.secs("CACHE_TTL_SEARCH_SECS", d.cache.ttl_search)?,
            },
            breaker: BreakerConfig {
                failure_threshold: env
                    .parse("BREAKER_FAILURE_THRESHOLD", d.breaker.failure_threshold)?,
                window: env.secs("BREAKER_WINDOW_SECS", d.breaker.window)?,
                cooldown: env.secs("BREAKER_COOLDOWN_SECS", d.breaker.cooldown)?,
            },
            tasks: TaskConfig {
                workers: env.parse("TASK_WORKERS", d.tasks.workers)?,
                default_timeout: env.secs("TASK_TIMEOUT_SECS", d.tasks.default_timeout)?,
                retention: env.secs("TASK_RETENTION_SECS", d.tasks.retention)?,
                sweep_interval: env.secs("SWEEP_INTERVAL_SECS", d.tasks.sweep_interval)?,
                shutdown_drain: env.secs("SHUTDOWN_DRAIN_SECS", d.tasks.shutdown_drain)?,
            },
            weather: WeatherApiConfig {
                base_url: env.string("WEATHER_API_BASE_URL").unwrap_or(d.weather.base_url),
                geocoding_url: env.string("GEOCODING_API_URL").unwrap_or(d.weather.geocoding_url),
                timeout: env.secs("WEATHER_API_TIMEOUT_SECS", d.weather.timeout)?,
            },
            reasoner,
            enable_cors: env.parse("ENABLE_CORS", d.enable_cors)?,
            max_body_bytes: env.parse("MAX_BODY_BYTES", d.max_body_bytes)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zero = |var: &'static str| ConfigError::Invalid {
            var,
            value: "0".to_string(),
        };
        if self.rate_limit.window.is_zero() {
            return Err(zero("RATE_LIMIT_WINDOW_SECS"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(zero("BREAKER_FAILURE_THRESHOLD"));
        }
        if self.tasks.workers == 0 {
            return Err(zero("TASK_WORKERS"));
        }
        if self.tasks.sweep_interval.is_zero() {
            return Err(zero("SWEEP_INTERVAL_SECS"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.lookup)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match self.string(var) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { var, value: raw }),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<AgentConfig, ConfigError> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AgentConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.port, 8001);
        assert_eq!(cfg.agent_id, "weather-agent-001");
        assert_eq!(cfg.rate_limit.per_window, 60);
        assert_eq!(cfg.rate_limit.burst, 10);
        assert_eq!(cfg.cache.ttl_search, Duration::from_secs(3600));
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.tasks.default_timeout, Duration::from_secs(120));
        assert!(cfg.reasoner.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config_from(&[
            ("PORT", "9000"),
            ("CACHE_CAPACITY", "16"),
            ("BREAKER_COOLDOWN_SECS", "5"),
            ("ENABLE_CORS", "false"),
            ("OPENAI_API_KEY", "sk-test"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.cache.capacity, 16);
        assert_eq!(cfg.breaker.cooldown, Duration::from_secs(5));
        assert!(!cfg.enable_cors);
        let reasoner = cfg.reasoner.unwrap();
        assert_eq!(reasoner.model, "gpt-4o-mini");
        assert_eq!(reasoner.base_url, DEFAULT_OPENAI_BASE_URL);
    }

    #[test]
    fn unparseable_value_names_the_variable() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "PORT",
                value: "eighty".to_string()
            }
        );
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(config_from(&[("TASK_WORKERS", "0")]).is_err());
    }
}
