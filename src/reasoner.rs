// Clima Agent -- Reasoner boundary
//
// Turns a free-text question into one planned capability call. The only
// implementation talks to an OpenAI-compatible chat-completions endpoint and
// forces a tool call; the tool list is built from the capability registry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::capabilities::CapabilitySpec;
use crate::config::ReasonerConfig;

const SYSTEM_PROMPT: &str = "You are the planner of a weather agent. \
Pick exactly one tool that answers the user's question and fill in its arguments. \
Use the city name as written by the user.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCall {
    pub capability: String,
    pub params: Value,
}

/// Tool offered to the reasoner.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&CapabilitySpec> for ToolDeclaration {
    fn from(spec: &CapabilitySpec) -> Self {
        Self {
            name: spec.name.to_string(),
            description: spec.description.to_string(),
            parameters: spec.input_schema.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReasonerError {
    #[error("reasoner unreachable: {0}")]
    Transport(String),

    #[error("reasoner timed out")]
    Timeout,

    #[error("reasoner returned HTTP {0}")]
    Status(u16),

    #[error("reasoner did not choose a tool")]
    NoToolCall,

    #[error("reasoner response could not be decoded: {0}")]
    Decode(String),
}

impl ReasonerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReasonerError::Transport(_) | ReasonerError::Timeout => true,
            ReasonerError::Status(status) => *status == 429 || *status >= 500,
            ReasonerError::NoToolCall | ReasonerError::Decode(_) => false,
        }
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn plan(&self, query: &str, tools: &[ToolDeclaration]) -> Result<PlannedCall, ReasonerError>;
}

// ── OpenAI-compatible implementation ─────────────────────────────────────────

pub struct OpenAiReasoner {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiReasoner {
    pub fn new(config: &ReasonerConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn request_body(&self, query: &str, tools: &[ToolDeclaration]) -> Value {
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": query},
            ],
            "tools": tools,
            "tool_choice": "required",
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    /// JSON-encoded object.
    arguments: String,
}

fn plan_from_response(resp: ChatResponse) -> Result<PlannedCall, ReasonerError> {
    let call = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.tool_calls?.into_iter().next())
        .ok_or(ReasonerError::NoToolCall)?;
    let params: Value = if call.function.arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&call.function.arguments)
            .map_err(|e| ReasonerError::Decode(e.to_string()))?
    };
    Ok(PlannedCall {
        capability: call.function.name,
        params,
    })
}

#[async_trait]
impl Reasoner for OpenAiReasoner {
    async fn plan(&self, query: &str, tools: &[ToolDeclaration]) -> Result<PlannedCall, ReasonerError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(query, tools))
            .send()
            .await
            .map_err(|e| ReasonerError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "reasoner: chat completion rejected");
            return Err(ReasonerError::Status(status.as_u16()));
        }
        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ReasonerError::Decode(e.to_string()))?;
        let plan = plan_from_response(body)?;
        tracing::debug!(capability = %plan.capability, "reasoner: planned call");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tool_call_becomes_the_plan() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_forecast", "arguments": "{\"location\":\"Bilbao\",\"days\":2}"}
                    }]
                }
            }]
        }))
        .unwrap();
        let plan = plan_from_response(resp).unwrap();
        assert_eq!(plan.capability, "get_forecast");
        assert_eq!(plan.params, json!({"location": "Bilbao", "days": 2}));
    }

    #[test]
    fn text_only_answer_is_not_a_plan() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "It is sunny."}}]
        }))
        .unwrap();
        assert_eq!(plan_from_response(resp).unwrap_err(), ReasonerError::NoToolCall);
    }

    #[test]
    fn retry_classification() {
        assert!(ReasonerError::Transport("reset".into()).is_retryable());
        assert!(ReasonerError::Status(502).is_retryable());
        assert!(!ReasonerError::Status(401).is_retryable());
        assert!(!ReasonerError::NoToolCall.is_retryable());
    }
}
