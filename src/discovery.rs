// Clima Agent -- Discovery
//
// The agent card served at /.well-known/agent.json and returned by the
// `get_agent_info` / `get_capabilities` built-ins. Rendered once at startup
// from the registry and the static agent metadata.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::capabilities::{CapabilityExample, CapabilityRegistry, CapabilitySpec};
use crate::config::AgentConfig;
use crate::rate_limit::RateLimitPolicy;

pub const WELL_KNOWN_PATH: &str = "/.well-known/agent.json";
const CARD_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize)]
pub struct AgentCard {
    pub agent: AgentInfo,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub communication: Communication,
    pub discovery: DiscoveryInfo,
    pub authentication: Authentication,
    pub rate_limiting: RateLimitPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub status: String,
    pub endpoint: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub examples: Vec<CapabilityExample>,
    pub async_eligible: bool,
}

impl From<&CapabilitySpec> for CapabilityDescriptor {
    fn from(spec: &CapabilitySpec) -> Self {
        Self {
            name: spec.name.to_string(),
            description: spec.description.to_string(),
            input_schema: spec.input_schema.clone(),
            output_schema: spec.output_schema.clone(),
            examples: spec.examples.clone(),
            async_eligible: spec.is_async_eligible,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Communication {
    pub protocol: &'static str,
    pub transport: &'static str,
    pub endpoints: Endpoints,
    pub supported_methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Endpoints {
    pub rpc: String,
    pub health: String,
    pub status: String,
    pub tasks: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryInfo {
    pub well_known_path: &'static str,
    pub last_updated: DateTime<Utc>,
    pub ttl: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Authentication {
    pub required: bool,
    pub methods: Vec<&'static str>,
}

impl AgentCard {
    pub fn build(registry: &CapabilityRegistry, config: &AgentConfig, rate_limit: RateLimitPolicy) -> Self {
        let base = config.public_url.trim_end_matches('/').to_string();
        let metadata = serde_json::json!({
            "provider": "Open-Meteo",
            "supported_languages": ["es", "en"],
            "coverage": "global",
            "natural_language": config.reasoner.is_some(),
        });
        Self {
            agent: AgentInfo {
                id: config.agent_id.clone(),
                name: config.agent_name.clone(),
                description: "Weather information agent backed by the Open-Meteo API".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                status: "active".to_string(),
                endpoint: base.clone(),
                metadata,
            },
            capabilities: registry.capabilities().map(CapabilityDescriptor::from).collect(),
            communication: Communication {
                protocol: "JSON-RPC 2.0",
                transport: "HTTP",
                endpoints: Endpoints {
                    rpc: format!("{base}/rpc"),
                    health: format!("{base}/health"),
                    status: format!("{base}/status"),
                    tasks: format!("{base}/tasks"),
                },
                supported_methods: registry.method_names().map(str::to_string).collect(),
            },
            discovery: DiscoveryInfo {
                well_known_path: WELL_KNOWN_PATH,
                last_updated: Utc::now(),
                ttl: CARD_TTL_SECS,
            },
            authentication: Authentication {
                required: false,
                methods: vec!["none"],
            },
            rate_limiting: rate_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn card_lists_capabilities_and_all_methods() {
        let config = AgentConfig::default();
        let registry = CapabilityRegistry::standard(&config.cache, false).unwrap();
        let policy = RateLimitPolicy {
            limit: 60,
            burst: 10,
            window: Duration::from_secs(60),
        };
        let card = AgentCard::build(&registry, &config, policy);
        let v = serde_json::to_value(&card).unwrap();

        assert_eq!(v["agent"]["id"], "weather-agent-001");
        assert_eq!(v["communication"]["protocol"], "JSON-RPC 2.0");
        assert_eq!(v["communication"]["endpoints"]["rpc"], "http://localhost:8001/rpc");
        assert_eq!(v["capabilities"].as_array().unwrap().len(), 3);
        let methods: Vec<&str> = v["communication"]["supported_methods"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(methods.contains(&"submit_task"));
        assert!(methods.contains(&"get_forecast"));
        assert_eq!(v["authentication"]["methods"][0], "none");
        assert_eq!(v["rate_limiting"]["window_seconds"], 60);
        assert_eq!(v["discovery"]["well_known_path"], WELL_KNOWN_PATH);
    }
}
