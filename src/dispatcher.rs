// Clima Agent -- Dispatcher
//
// One JSON-RPC call, gate by gate:
//   envelope -> method lookup -> rate limit -> params -> breaker -> cache
//   -> (task submission | synchronous invoke) -> breaker report / cache write
//
// Every failure is a `DispatchError`; `to_rpc_error` is the only place that
// decides what goes on the wire.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::cache::{ResponseCache, cache_key};
use crate::capabilities::{
    Builtin, CapabilityCall, CapabilityKind, CapabilityRegistry, CapabilitySpec, InvalidParams,
    MethodKind, RegistryError, Resource, WeatherCall, decode_params,
};
use crate::circuit_breaker::{BreakerPolicy, CallPermit, CircuitBreakers, CircuitOpen};
use crate::config::AgentConfig;
use crate::discovery::AgentCard;
use crate::rate_limit::{CallerKey, RateLimitPolicy, RateLimited, RateLimiter};
use crate::reasoner::{Reasoner, ReasonerError, ToolDeclaration};
use crate::rpc::{RequestId, RpcError, RpcRequest, RpcResponse, codes};
use crate::tasks::{NewTask, Task, TaskError, TaskId, TaskStore};
use crate::weather::{UpstreamError, WeatherProvider};

/// Upper bound for a caller-supplied `timeout_seconds`.
pub const MAX_TASK_TIMEOUT_SECS: u64 = 3600;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(#[from] InvalidParams),

    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Reasoning(#[from] ReasonerError),

    #[error("planned call rejected: {0}")]
    PlanRejected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Map to the wire. Messages never carry transport or internal details.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            DispatchError::Parse(detail) => RpcError::parse_error(detail),
            DispatchError::InvalidRequest(detail) => RpcError::invalid_request(detail.clone()),
            DispatchError::MethodNotFound(method) => {
                RpcError::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
                    .with_data(json!({ "method": method }))
            }
            DispatchError::InvalidParams(p) => RpcError::new(codes::INVALID_PARAMS, "Invalid params")
                .with_data(json!({ "detail": p.0 })),
            DispatchError::RateLimited(r) => RpcError::new(codes::RATE_LIMITED, "Rate limit exceeded")
                .with_data(json!({ "retry_after_seconds": r.retry_after_secs() })),
            DispatchError::CircuitOpen(c) => {
                RpcError::new(codes::SERVICE_UNAVAILABLE, "Service temporarily unavailable").with_data(
                    json!({ "resource": c.resource, "retry_after_seconds": c.retry_after_secs() }),
                )
            }
            DispatchError::Task(TaskError::NotFound(id)) => {
                RpcError::new(codes::TASK_NOT_FOUND, "Task not found").with_data(json!({ "task_id": id }))
            }
            DispatchError::Task(TaskError::InvalidTransition { task_id, from, to }) => RpcError::new(
                codes::INVALID_TASK_TRANSITION,
                format!("Task is already {from} and cannot become {to}"),
            )
            .with_data(json!({ "task_id": task_id, "from": from, "to": to })),
            DispatchError::Task(TaskError::Closed) => {
                RpcError::new(codes::SERVICE_UNAVAILABLE, "Agent is shutting down")
                    .with_data(json!({ "resource": "task_store", "retry_after_seconds": null }))
            }
            DispatchError::Upstream(e) if e.is_retryable() => {
                RpcError::new(codes::UPSTREAM_FAILURE, "Upstream weather service failed")
                    .with_data(json!({ "retryable": true }))
            }
            DispatchError::Upstream(e) => RpcError::new(codes::UPSTREAM_FAILURE, e.to_string())
                .with_data(json!({ "retryable": false })),
            DispatchError::Reasoning(e) => {
                RpcError::new(codes::UPSTREAM_FAILURE, "Capability execution failed")
                    .with_data(json!({ "retryable": e.is_retryable() }))
            }
            DispatchError::PlanRejected(_) => {
                RpcError::new(codes::UPSTREAM_FAILURE, "Capability execution failed")
                    .with_data(json!({ "retryable": false }))
            }
            DispatchError::Internal(_) => RpcError::new(codes::INTERNAL_ERROR, "Internal error"),
        }
    }
}

/// Await an upstream call, bounded by `deadline` when one is set. Elapsing
/// yields `elapsed`, which the caller reports to the breaker like any other
/// failure.
async fn bounded<T, E>(
    deadline: Option<tokio::time::Instant>,
    call: impl Future<Output = Result<T, E>>,
    elapsed: E,
) -> Result<T, E> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, call).await.unwrap_or(Err(elapsed)),
        None => call.await,
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// The method is not cacheable.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Executed {
    pub value: Arc<Value>,
    pub cache: CacheStatus,
}

impl Executed {
    fn fresh(value: Value) -> Self {
        Self {
            value: Arc::new(value),
            cache: CacheStatus::Bypass,
        }
    }
}

/// A response to a single request, plus the out-of-band cache marker.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: RpcResponse,
    pub cache: CacheStatus,
}

impl Dispatched {
    fn error(id: RequestId, err: &DispatchError) -> Self {
        Self {
            response: RpcResponse::failure(id, err.to_rpc_error()),
            cache: CacheStatus::Bypass,
        }
    }
}

/// What to send back for a whole HTTP body.
#[derive(Debug, Clone)]
pub enum Reply {
    Single(Dispatched),
    Batch(Vec<RpcResponse>),
    /// Only notifications were received.
    Empty,
}

#[derive(Debug, Deserialize)]
struct SubmitTaskParams {
    capability: String,
    #[serde(default)]
    input_data: Value,
    #[serde(default)]
    priority: i32,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TaskIdParams {
    task_id: String,
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

pub struct DispatcherParts {
    pub registry: CapabilityRegistry,
    pub cache: ResponseCache,
    pub limiter: RateLimiter,
    pub breakers: CircuitBreakers,
    pub tasks: Arc<TaskStore>,
    pub weather: Arc<dyn WeatherProvider>,
    pub reasoner: Option<Arc<dyn Reasoner>>,
    pub card: AgentCard,
    pub default_task_timeout: Duration,
}

pub struct Dispatcher {
    registry: CapabilityRegistry,
    cache: ResponseCache,
    limiter: RateLimiter,
    breakers: CircuitBreakers,
    tasks: Arc<TaskStore>,
    weather: Arc<dyn WeatherProvider>,
    reasoner: Option<Arc<dyn Reasoner>>,
    card: AgentCard,
    default_task_timeout: Duration,
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        Self {
            registry: parts.registry,
            cache: parts.cache,
            limiter: parts.limiter,
            breakers: parts.breakers,
            tasks: parts.tasks,
            weather: parts.weather,
            reasoner: parts.reasoner,
            card: parts.card,
            default_task_timeout: parts.default_task_timeout,
        }
    }

    /// Wire every component from configuration.
    pub fn from_config(
        config: &AgentConfig,
        weather: Arc<dyn WeatherProvider>,
        reasoner: Option<Arc<dyn Reasoner>>,
    ) -> Result<Self, RegistryError> {
        let registry = CapabilityRegistry::standard(&config.cache, reasoner.is_some())?;
        let rate_policy = RateLimitPolicy {
            limit: config.rate_limit.per_window,
            burst: config.rate_limit.burst,
            window: config.rate_limit.window,
        };
        let breakers = CircuitBreakers::new(
            registry.resources().into_iter().map(Resource::as_str),
            BreakerPolicy {
                failure_threshold: config.breaker.failure_threshold,
                failure_window: config.breaker.window,
                cooldown: config.breaker.cooldown,
            },
        );
        let card = AgentCard::build(&registry, config, rate_policy);
        Ok(Self::new(DispatcherParts {
            registry,
            cache: ResponseCache::new(config.cache.capacity),
            limiter: RateLimiter::new(rate_policy),
            breakers,
            tasks: Arc::new(TaskStore::new()),
            weather,
            reasoner,
            card,
            default_task_timeout: config.tasks.default_timeout,
        }))
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn card(&self) -> &AgentCard {
        &self.card
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Handle a raw HTTP body: a single request or a batch.
    pub async fn handle_body(&self, body: &[u8], caller: &CallerKey) -> Reply {
        let value: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(caller = %caller, "rpc: unparseable body: {}", e);
                let err = DispatchError::Parse(e.to_string());
                return Reply::Single(Dispatched::error(RequestId::Null, &err));
            }
        };
        match value {
            Value::Array(items) if items.is_empty() => {
                let err = DispatchError::InvalidRequest("empty batch".to_string());
                Reply::Single(Dispatched::error(RequestId::Null, &err))
            }
            Value::Array(items) => {
                let responses: Vec<RpcResponse> = join_all(items.into_iter().map(|item| self.handle(item, caller)))
                    .await
                    .into_iter()
                    .flatten()
                    .map(|d| d.response)
                    .collect();
                if responses.is_empty() {
                    Reply::Empty
                } else {
                    Reply::Batch(responses)
                }
            }
            single => match self.handle(single, caller).await {
                Some(d) => Reply::Single(d),
                None => Reply::Empty,
            },
        }
    }

    /// Handle one decoded request. `None` for notifications.
    pub async fn handle(&self, raw: Value, caller: &CallerKey) -> Option<Dispatched> {
        let request = match RpcRequest::from_value(raw) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(caller = %caller, "rpc: invalid envelope: {}", e.reason);
                let id = e.id.clone();
                return Some(Dispatched::error(id, &DispatchError::InvalidRequest(e.reason)));
            }
        };

        let started = Instant::now();
        let outcome = self.route(&request, caller).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(exec) => tracing::info!(
                method = %request.method,
                caller = %caller,
                cache = exec.cache.as_str(),
                elapsed_ms,
                "rpc: ok"
            ),
            Err(DispatchError::Internal(detail)) => tracing::error!(
                method = %request.method,
                caller = %caller,
                elapsed_ms,
                "rpc: internal error: {}",
                detail
            ),
            Err(err) => tracing::info!(
                method = %request.method,
                caller = %caller,
                code = err.to_rpc_error().code,
                elapsed_ms,
                "rpc: failed: {}",
                err
            ),
        }

        let id = request.id?;
        Some(match outcome {
            Ok(exec) => Dispatched {
                response: RpcResponse::success(id, exec.value.as_ref().clone()),
                cache: exec.cache,
            },
            Err(err) => Dispatched::error(id, &err),
        })
    }

    async fn route(&self, request: &RpcRequest, caller: &CallerKey) -> Result<Executed, DispatchError> {
        let spec = self
            .registry
            .lookup(&request.method)
            .ok_or_else(|| DispatchError::MethodNotFound(request.method.clone()))?;

        self.limiter.check(caller)?;

        match spec.kind {
            MethodKind::Builtin(builtin) => self.run_builtin(builtin, &request.params, caller).map(Executed::fresh),
            MethodKind::Capability(kind) => {
                let call = CapabilityCall::parse(kind, &request.params)?;
                self.execute_capability(spec, call, None).await
            }
        }
    }

    fn run_builtin(&self, builtin: Builtin, params: &Value, caller: &CallerKey) -> Result<Value, DispatchError> {
        let to_value = |v: Result<Value, serde_json::Error>| v.map_err(|e| DispatchError::Internal(e.to_string()));
        match builtin {
            Builtin::GetAgentInfo => to_value(serde_json::to_value(&self.card.agent)),
            Builtin::GetCapabilities => to_value(serde_json::to_value(&self.card.capabilities)),
            Builtin::SubmitTask => self.submit_task(params, caller),
            Builtin::GetTaskStatus => {
                let p: TaskIdParams = decode_params(params)?;
                let task = self.tasks.get_task(&TaskId::from(p.task_id.as_str()))?;
                to_value(serde_json::to_value(&task))
            }
            Builtin::CancelTask => {
                let p: TaskIdParams = decode_params(params)?;
                let task = self.tasks.cancel_task(&TaskId::from(p.task_id.as_str()))?;
                Ok(json!({ "task_id": task.task_id, "status": task.status, "cancelled": true }))
            }
        }
    }

    fn submit_task(&self, params: &Value, caller: &CallerKey) -> Result<Value, DispatchError> {
        let p: SubmitTaskParams = decode_params(params)?;
        let not_eligible = || InvalidParams(format!("'{}' cannot be submitted as a task", p.capability));

        let spec = self.registry.lookup(&p.capability).ok_or_else(not_eligible)?;
        let kind = match spec.kind {
            MethodKind::Capability(kind) if spec.is_async_eligible => kind,
            _ => return Err(not_eligible().into()),
        };
        let call = CapabilityCall::parse(kind, &p.input_data)?;

        if let Some(breaker) = spec.resource.and_then(|r| self.breakers.get(r.as_str())) {
            breaker.peek()?;
        }

        let timeout = match p.timeout_seconds {
            None => self.default_task_timeout,
            Some(secs) if (1..=MAX_TASK_TIMEOUT_SECS).contains(&secs) => Duration::from_secs(secs),
            Some(_) => {
                return Err(InvalidParams(format!(
                    "timeout_seconds must be between 1 and {MAX_TASK_TIMEOUT_SECS}"
                ))
                .into());
            }
        };

        let task = self.tasks.create_task(NewTask {
            agent_id: caller.to_string(),
            capability: spec.name.to_string(),
            input_data: call.normalized_params(),
            priority: p.priority,
            timeout,
        })?;
        Ok(json!({
            "task_id": task.task_id,
            "status": task.status,
            "created_at": task.created_at,
        }))
    }

    /// Run a task's capability through the same guarded path as a direct call.
    /// Upstream calls are cut off at `deadline` and count as timeouts.
    pub async fn execute_task(
        &self,
        task: &Task,
        deadline: tokio::time::Instant,
    ) -> Result<Value, DispatchError> {
        let spec = self
            .registry
            .lookup(&task.capability)
            .ok_or_else(|| DispatchError::MethodNotFound(task.capability.clone()))?;
        let MethodKind::Capability(kind) = spec.kind else {
            return Err(DispatchError::Internal(format!("task targets built-in '{}'", spec.name)));
        };
        let call = CapabilityCall::parse(kind, &task.input_data)?;
        let executed = self.execute_capability(spec, call, Some(deadline)).await?;
        Ok(executed.value.as_ref().clone())
    }

    async fn execute_capability(
        &self,
        spec: &CapabilitySpec,
        call: CapabilityCall,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Executed, DispatchError> {
        match call {
            CapabilityCall::Weather(call) => self.execute_weather(spec, &call, deadline).await,
            CapabilityCall::ProcessQuery(p) => self
                .process_query(&p.query, deadline)
                .await
                .map(Executed::fresh),
        }
    }

    fn acquire(&self, resource: Option<Resource>) -> Result<Option<CallPermit>, DispatchError> {
        let Some(resource) = resource else {
            return Ok(None);
        };
        let breaker = self
            .breakers
            .get(resource.as_str())
            .ok_or_else(|| DispatchError::Internal(format!("no circuit breaker for {}", resource.as_str())))?;
        Ok(Some(breaker.try_acquire()?))
    }

    /// Breaker, cache, upstream, report. No lock is held across the await.
    async fn execute_weather(
        &self,
        spec: &CapabilitySpec,
        call: &WeatherCall,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Executed, DispatchError> {
        let permit = self.acquire(spec.resource)?;

        let key = spec.cache_ttl.map(|_| cache_key(spec.name, &call.normalized_params()));
        if let Some(key) = &key
            && let Some(hit) = self.cache.get(key)
        {
            drop(permit);
            return Ok(Executed {
                value: hit,
                cache: CacheStatus::Hit,
            });
        }

        let started = Instant::now();
        let outcome = bounded(deadline, call.invoke(self.weather.as_ref()), UpstreamError::Timeout).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                let value = Arc::new(value);
                if let (Some(key), Some(ttl)) = (key, spec.cache_ttl) {
                    self.cache.insert(key, value.clone(), ttl);
                }
                tracing::debug!(capability = spec.name, elapsed_ms, "capability: upstream call ok");
                Ok(Executed {
                    value,
                    cache: if spec.cache_ttl.is_some() { CacheStatus::Miss } else { CacheStatus::Bypass },
                })
            }
            Err(err) => {
                let retryable = err.is_retryable();
                if let Some(permit) = permit {
                    if retryable {
                        permit.failure();
                    } else {
                        permit.neutral();
                    }
                }
                if retryable {
                    tracing::warn!(capability = spec.name, elapsed_ms, "capability: upstream failure: {}", err);
                } else {
                    tracing::debug!(capability = spec.name, elapsed_ms, "capability: rejected upstream: {}", err);
                }
                Err(err.into())
            }
        }
    }

    async fn process_query(
        &self,
        query: &str,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Value, DispatchError> {
        let reasoner = self
            .reasoner
            .as_ref()
            .ok_or_else(|| DispatchError::Internal("process_query registered without a reasoner".into()))?;

        let tools: Vec<ToolDeclaration> = self
            .registry
            .capabilities()
            .filter(|s| s.kind != MethodKind::Capability(CapabilityKind::ProcessQuery))
            .map(ToolDeclaration::from)
            .collect();

        let permit = self.acquire(Some(Resource::Reasoner))?;
        let plan = match bounded(deadline, reasoner.plan(query, &tools), ReasonerError::Timeout).await {
            Ok(plan) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                plan
            }
            Err(err) => {
                if let Some(permit) = permit {
                    if err.is_retryable() {
                        permit.failure();
                    } else {
                        permit.neutral();
                    }
                }
                tracing::warn!("process_query: reasoner failed: {}", err);
                return Err(err.into());
            }
        };

        let spec = self
            .registry
            .lookup(&plan.capability)
            .ok_or_else(|| DispatchError::PlanRejected(format!("unknown capability '{}'", plan.capability)))?;
        let call = match spec.kind {
            MethodKind::Capability(kind) if kind != CapabilityKind::ProcessQuery => {
                match CapabilityCall::parse(kind, &plan.params) {
                    Ok(CapabilityCall::Weather(call)) => call,
                    Ok(CapabilityCall::ProcessQuery(_)) => {
                        return Err(DispatchError::PlanRejected("recursive plan".into()));
                    }
                    Err(e) => return Err(DispatchError::PlanRejected(e.0)),
                }
            }
            _ => {
                return Err(DispatchError::PlanRejected(format!(
                    "'{}' is not a plannable capability",
                    spec.name
                )));
            }
        };

        let executed = self.execute_weather(spec, &call, deadline).await?;
        Ok(json!({
            "query": query,
            "plan": { "capability": spec.name, "params": call.normalized_params() },
            "result": executed.value.as_ref(),
        }))
    }
}
