// Clima Agent -- A2A client
//
// Outbound side of the protocol: discover another agent through its card,
// call its JSON-RPC methods, and run capabilities on it as tasks.
//
// Responses are validated before use: `jsonrpc` must be "2.0", the `id`
// must echo the request's, and exactly one of `result` / `error` is present.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::discovery::WELL_KNOWN_PATH;
use crate::handlers::AGENT_ID_HEADER;
use crate::rpc::{JSONRPC_VERSION, RequestId, RpcError};
use crate::tasks::{Task, TaskFailure, TaskId, TaskStatus};

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum A2aClientError {
    #[error("agent unreachable: {0}")]
    Transport(String),

    #[error("agent timed out")]
    Timeout,

    #[error("agent returned HTTP {status}")]
    Status { status: u16, body: String },

    #[error("agent sent an unreadable response: {0}")]
    Decode(String),

    #[error("agent sent an invalid JSON-RPC response: {0}")]
    InvalidResponse(String),

    #[error("agent answered with error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("task {task_id} failed")]
    TaskFailed {
        task_id: TaskId,
        failure: Option<TaskFailure>,
    },

    #[error("gave up waiting for task {0}")]
    WaitTimedOut(TaskId),
}

impl From<reqwest::Error> for A2aClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            A2aClientError::Timeout
        } else if e.is_decode() {
            A2aClientError::Decode(e.to_string())
        } else {
            A2aClientError::Transport(e.to_string())
        }
    }
}

impl From<RpcError> for A2aClientError {
    fn from(e: RpcError) -> Self {
        A2aClientError::Rpc {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

/// What a card tells us about another agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAgent {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub status: String,
    /// Base URL the card was fetched from.
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub supported_methods: Vec<String>,
}

impl RemoteAgent {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

#[derive(Debug, Deserialize)]
struct CardDoc {
    agent: CardAgent,
    #[serde(default)]
    capabilities: Vec<CardCapability>,
    #[serde(default)]
    communication: Option<CardCommunication>,
}

#[derive(Debug, Deserialize)]
struct CardAgent {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    version: String,
    #[serde(default = "unknown_status")]
    status: String,
}

fn unknown_status() -> String {
    "unknown".to_string()
}

#[derive(Debug, Deserialize)]
struct CardCapability {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CardCommunication {
    #[serde(default)]
    supported_methods: Vec<String>,
}

/// Options for `submit_task`; unset fields use the remote agent's defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    pub priority: Option<i32>,
    pub timeout_seconds: Option<u64>,
}

/// How `wait_for_task` polls.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct A2aClient {
    client: Client,
    /// Sent as `X-Agent-Id` so the remote limiter can tell us apart.
    agent_id: Option<String>,
    next_id: AtomicU64,
    discovered: Mutex<HashMap<String, RemoteAgent>>,
}

impl A2aClient {
    pub fn new(timeout: Duration, agent_id: Option<String>) -> Result<Self, A2aClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("clima-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, agent_id))
    }

    pub fn with_client(client: Client, agent_id: Option<String>) -> Self {
        Self {
            client,
            agent_id,
            next_id: AtomicU64::new(1),
            discovered: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RemoteAgent>> {
        self.discovered.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with_identity(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.agent_id {
            Some(id) => req.header(AGENT_ID_HEADER, id),
            None => req,
        }
    }

    // ── Discovery ───────────────────────────────────────────────────────

    /// Fetch and remember the agent card published under `base_url`.
    pub async fn discover(&self, base_url: &str) -> Result<RemoteAgent, A2aClientError> {
        let base = base_url.trim_end_matches('/');
        let url = format!("{base}{WELL_KNOWN_PATH}");
        let resp = self.with_identity(self.client.get(&url)).send().await?;
        let body = check_status(resp).await?.bytes().await?;
        let card: CardDoc = serde_json::from_slice(&body).map_err(|e| A2aClientError::Decode(e.to_string()))?;

        let agent = RemoteAgent {
            id: card.agent.id,
            name: card.agent.name,
            description: card.agent.description,
            version: card.agent.version,
            status: card.agent.status,
            endpoint: base.to_string(),
            capabilities: card.capabilities.into_iter().map(|c| c.name).collect(),
            supported_methods: card.communication.map(|c| c.supported_methods).unwrap_or_default(),
        };
        tracing::info!(
            agent_id = %agent.id,
            endpoint = %agent.endpoint,
            capabilities = ?agent.capabilities,
            "a2a: agent discovered"
        );
        self.lock().insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    /// Discover several agents concurrently. Unreachable ones are skipped.
    pub async fn discover_all(&self, base_urls: &[&str]) -> Vec<RemoteAgent> {
        join_all(base_urls.iter().map(|url| async move {
            self.discover(url)
                .await
                .inspect_err(|e| tracing::warn!(endpoint = %url, "a2a: discovery failed: {}", e))
                .ok()
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn discovered(&self) -> Vec<RemoteAgent> {
        let mut agents: Vec<RemoteAgent> = self.lock().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn agent(&self, agent_id: &str) -> Option<RemoteAgent> {
        self.lock().get(agent_id).cloned()
    }

    pub fn agents_with_capability(&self, capability: &str) -> Vec<RemoteAgent> {
        self.discovered()
            .into_iter()
            .filter(|a| a.has_capability(capability))
            .collect()
    }

    // ── JSON-RPC ────────────────────────────────────────────────────────

    /// Call `method` on the agent at `base_url` and return its `result`.
    pub async fn call(&self, base_url: &str, method: &str, params: Value) -> Result<Value, A2aClientError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed).into());
        let url = format!("{}/rpc", base_url.trim_end_matches('/'));
        let body = json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
            "id": id,
        });

        let started = std::time::Instant::now();
        let resp = self.with_identity(self.client.post(&url).json(&body)).send().await?;
        let bytes = check_status(resp).await?.bytes().await?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| A2aClientError::Decode(e.to_string()))?;
        let outcome = read_response(value, &id);
        tracing::debug!(
            url = %url,
            method,
            ok = outcome.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "a2a: rpc call"
        );
        outcome
    }

    pub async fn get_agent_info(&self, base_url: &str) -> Result<Value, A2aClientError> {
        self.call(base_url, "get_agent_info", json!({})).await
    }

    pub async fn get_capabilities(&self, base_url: &str) -> Result<Vec<Value>, A2aClientError> {
        match self.call(base_url, "get_capabilities", json!({})).await? {
            Value::Array(items) => Ok(items),
            other => Err(A2aClientError::InvalidResponse(format!(
                "get_capabilities returned {other}"
            ))),
        }
    }

    /// Run a capability synchronously and return its result.
    pub async fn execute(&self, base_url: &str, capability: &str, input: Value) -> Result<Value, A2aClientError> {
        self.call(base_url, capability, input).await
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    pub async fn submit_task(
        &self,
        base_url: &str,
        capability: &str,
        input_data: Value,
        options: TaskOptions,
    ) -> Result<TaskId, A2aClientError> {
        let mut params = Map::new();
        params.insert("capability".into(), json!(capability));
        params.insert("input_data".into(), input_data);
        if let Some(priority) = options.priority {
            params.insert("priority".into(), json!(priority));
        }
        if let Some(timeout) = options.timeout_seconds {
            params.insert("timeout_seconds".into(), json!(timeout));
        }

        let result = self.call(base_url, "submit_task", Value::Object(params)).await?;
        let task_id = result
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| A2aClientError::InvalidResponse("submit_task result has no task_id".into()))?;
        tracing::info!(task_id, capability, "a2a: task submitted");
        Ok(TaskId::from(task_id))
    }

    pub async fn task_status(&self, base_url: &str, task_id: &TaskId) -> Result<Task, A2aClientError> {
        let result = self
            .call(base_url, "get_task_status", json!({ "task_id": task_id }))
            .await?;
        serde_json::from_value(result).map_err(|e| A2aClientError::Decode(e.to_string()))
    }

    pub async fn cancel_task(&self, base_url: &str, task_id: &TaskId) -> Result<Value, A2aClientError> {
        self.call(base_url, "cancel_task", json!({ "task_id": task_id }))
            .await
    }

    /// Poll until the task is completed or failed.
    pub async fn wait_for_task(
        &self,
        base_url: &str,
        task_id: &TaskId,
        policy: WaitPolicy,
    ) -> Result<Task, A2aClientError> {
        let deadline = tokio::time::Instant::now() + policy.max_wait;
        loop {
            let task = self.task_status(base_url, task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if tokio::time::Instant::now() + policy.poll_interval > deadline {
                tracing::warn!(task_id = %task_id, "a2a: stopped waiting for task");
                return Err(A2aClientError::WaitTimedOut(task_id.clone()));
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    /// Submit, wait, and unwrap the result of a completed task.
    pub async fn execute_as_task(
        &self,
        base_url: &str,
        capability: &str,
        input_data: Value,
        policy: WaitPolicy,
    ) -> Result<Value, A2aClientError> {
        let task_id = self
            .submit_task(base_url, capability, input_data, TaskOptions::default())
            .await?;
        let task = self.wait_for_task(base_url, &task_id, policy).await?;
        match (task.status, task.result) {
            (TaskStatus::Completed, Some(result)) => Ok(result),
            (TaskStatus::Completed, None) => Ok(Value::Null),
            _ => Err(A2aClientError::TaskFailed {
                task_id,
                failure: task.error,
            }),
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, A2aClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: String = resp.text().await.unwrap_or_default().chars().take(MAX_ERROR_BODY).collect();
    Err(A2aClientError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Validate a JSON-RPC 2.0 response to the request `expected` and unwrap it.
fn read_response(value: Value, expected: &RequestId) -> Result<Value, A2aClientError> {
    let invalid = |reason: &str| A2aClientError::InvalidResponse(reason.to_string());
    let Value::Object(mut obj) = value else {
        return Err(invalid("response is not an object"));
    };
    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid("jsonrpc must be \"2.0\""));
    }
    let id = obj
        .remove("id")
        .ok_or_else(|| invalid("response has no id"))
        .and_then(|id| serde_json::from_value::<RequestId>(id).map_err(|_| invalid("malformed id")))?;
    if &id != expected {
        return Err(invalid("response id does not match the request"));
    }
    match (obj.remove("result"), obj.remove("error")) {
        (Some(result), None) => Ok(result),
        (None, Some(error)) => {
            let error: RpcError = serde_json::from_value(error).map_err(|_| invalid("malformed error object"))?;
            Err(error.into())
        }
        _ => Err(invalid("exactly one of result or error is required")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> RequestId {
        RequestId::Number(n.into())
    }

    #[test]
    fn result_is_unwrapped() {
        let value = json!({"jsonrpc": "2.0", "result": {"ok": true}, "id": 4});
        assert_eq!(read_response(value, &id(4)).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn error_member_becomes_rpc_error() {
        let value = json!({"jsonrpc": "2.0", "error": {"code": -32003, "message": "Task not found"}, "id": 2});
        let err = read_response(value, &id(2)).unwrap_err();
        assert!(matches!(err, A2aClientError::Rpc { code: -32003, .. }), "{err:?}");
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let cases = [
            json!([]),
            json!({"jsonrpc": "1.0", "result": 1, "id": 1}),
            json!({"jsonrpc": "2.0", "result": 1}),
            json!({"jsonrpc": "2.0", "result": 1, "id": 9}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "result": 1, "error": {"code": 1, "message": "x"}, "id": 1}),
        ];
        for case in cases {
            let err = read_response(case.clone(), &id(1)).unwrap_err();
            assert!(matches!(err, A2aClientError::InvalidResponse(_)), "{case}: {err:?}");
        }
    }

    #[test]
    fn rpc_error_conversion_keeps_data() {
        let err: A2aClientError = RpcError::new(-32002, "Rate limit exceeded")
            .with_data(json!({"retry_after_seconds": 3}))
            .into();
        let A2aClientError::Rpc { data, .. } = err else {
            panic!("expected an rpc error");
        };
        assert_eq!(data.unwrap()["retry_after_seconds"], 3);
    }
}
