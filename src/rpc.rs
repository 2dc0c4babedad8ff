// Clima Agent -- JSON-RPC 2.0 envelope
//
// Wire types for requests and responses. Validation of the envelope lives
// here; everything after method lookup belongs to the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const JSONRPC_VERSION: &str = "2.0";

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const UPSTREAM_FAILURE: i32 = -32000;
    pub const SERVICE_UNAVAILABLE: i32 = -32001;
    pub const RATE_LIMITED: i32 = -32002;
    pub const TASK_NOT_FOUND: i32 = -32003;
    pub const INVALID_TASK_TRANSITION: i32 = -32004;
}

/// Request identifier. A request without an `id` member is a notification;
/// an explicit `null` is a regular request that is answered with `id: null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
    Null,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Null => f.write_str("null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    /// Always an object or array; an absent or `null` params member becomes `{}`.
    pub params: Value,
    /// `None` marks a notification.
    pub id: Option<RequestId>,
}

/// A structurally invalid envelope. Carries whatever id could be recovered so
/// the error response can still be correlated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct EnvelopeError {
    pub id: RequestId,
    pub reason: String,
}

impl RpcRequest {
    /// Validate a decoded JSON value as a JSON-RPC 2.0 request.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut obj) = value else {
            return Err(EnvelopeError {
                id: RequestId::Null,
                reason: "request must be a JSON object".to_string(),
            });
        };

        let id = match obj.remove("id") {
            None => None,
            Some(raw) => Some(parse_id(raw)?),
        };
        let reply_id = id.clone().unwrap_or(RequestId::Null);
        let invalid = |reason: &str| EnvelopeError {
            id: reply_id.clone(),
            reason: reason.to_string(),
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(_) => return Err(invalid("jsonrpc must be exactly \"2.0\"")),
            None => return Err(invalid("missing jsonrpc version")),
        }

        let method = match obj.remove("method") {
            Some(Value::String(m)) if !m.trim().is_empty() => m,
            Some(Value::String(_)) => return Err(invalid("method must not be empty")),
            Some(_) => return Err(invalid("method must be a string")),
            None => return Err(invalid("missing method")),
        };

        let params = match obj.remove("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(p @ (Value::Object(_) | Value::Array(_))) => p,
            Some(_) => return Err(invalid("params must be an object or an array")),
        };

        Ok(Self { method, params, id })
    }
}

fn parse_id(raw: Value) -> Result<RequestId, EnvelopeError> {
    match raw {
        Value::Null => Ok(RequestId::Null),
        Value::String(s) => Ok(RequestId::String(s)),
        Value::Number(n) => Ok(RequestId::Number(n)),
        _ => Err(EnvelopeError {
            id: RequestId::Null,
            reason: "id must be a string, a number or null".to_string(),
        }),
    }
}

// ── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, "Parse error").with_data(json!({ "detail": detail.to_string() }))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid Request")
            .with_data(json!({ "detail": detail.into() }))
    }
}

/// Exactly one of `result` / `error` is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
    pub id: RequestId,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            outcome: RpcOutcome::Result(result),
            id,
        }
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            outcome: RpcOutcome::Error(error),
            id,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            RpcOutcome::Result(v) => Some(v),
            RpcOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        match &self.outcome {
            RpcOutcome::Error(e) => Some(e),
            RpcOutcome::Result(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_id_is_a_notification_but_null_id_is_not() {
        let note = RpcRequest::from_value(json!({"jsonrpc": "2.0", "method": "ping"})).unwrap();
        assert_eq!(note.id, None);

        let req =
            RpcRequest::from_value(json!({"jsonrpc": "2.0", "method": "ping", "id": null})).unwrap();
        assert_eq!(req.id, Some(RequestId::Null));
    }

    #[test]
    fn missing_params_become_empty_object() {
        let req = RpcRequest::from_value(json!({"jsonrpc": "2.0", "method": "m", "id": 1})).unwrap();
        assert_eq!(req.params, json!({}));
    }

    #[test]
    fn wrong_version_keeps_id_for_the_reply() {
        let err = RpcRequest::from_value(json!({"jsonrpc": "1.0", "method": "m", "id": "abc"}))
            .unwrap_err();
        assert_eq!(err.id, RequestId::String("abc".into()));
    }

    #[test]
    fn rejects_non_object_and_bad_members() {
        assert!(RpcRequest::from_value(json!([1, 2])).is_err());
        assert!(RpcRequest::from_value(json!({"jsonrpc": "2.0", "method": 7, "id": 1})).is_err());
        assert!(RpcRequest::from_value(json!({"jsonrpc": "2.0", "method": "m", "params": 3})).is_err());
        assert!(RpcRequest::from_value(json!({"jsonrpc": "2.0", "method": "m", "id": {}})).is_err());
    }

    #[test]
    fn response_serializes_exactly_one_outcome() {
        let ok = serde_json::to_value(RpcResponse::success(
            RequestId::Number(7.into()),
            json!({"a": 1}),
        ))
        .unwrap();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "result": {"a": 1}, "id": 7}));

        let err = serde_json::to_value(RpcResponse::failure(
            RequestId::Null,
            RpcError::new(codes::METHOD_NOT_FOUND, "Method not found"),
        ))
        .unwrap();
        assert_eq!(
            err,
            json!({"jsonrpc": "2.0", "error": {"code": -32601, "message": "Method not found"}, "id": null})
        );
    }
}
