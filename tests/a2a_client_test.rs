// Clima Agent -- A2A client against a live agent and a mock server
//
// The happy paths talk to our own router over a real socket; wiremock
// covers the failure shapes a remote agent can send back.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clima_agent::a2a_client::{A2aClient, A2aClientError, TaskOptions, WaitPolicy};
use clima_agent::create_router;
use clima_agent::tasks::{FailureKind, TaskStatus, worker};

use common::{FakeWeather, app_state, test_config};

fn client() -> A2aClient {
    A2aClient::new(Duration::from_secs(5), Some("planner-7".to_string())).unwrap()
}

fn quick_wait() -> WaitPolicy {
    WaitPolicy {
        max_wait: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
    }
}

struct LiveAgent {
    base_url: String,
    shutdown: CancellationToken,
}

impl LiveAgent {
    /// Serve the real router on an ephemeral port, with task workers.
    async fn start() -> Self {
        let state = app_state(test_config(), FakeWeather::new());
        let shutdown = CancellationToken::new();
        worker::spawn_workers(1, Arc::clone(&state.dispatcher), shutdown.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state))
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            shutdown,
        }
    }
}

impl Drop for LiveAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn rpc_result(id: u64, result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "result": result, "id": id}))
}

#[tokio::test]
async fn discovers_a_live_agent_from_its_card() {
    let agent = LiveAgent::start().await;
    let client = client();

    let remote = client.discover(&format!("{}/", agent.base_url)).await.unwrap();
    assert_eq!(remote.id, "weather-agent-001");
    assert_eq!(remote.status, "active");
    assert_eq!(remote.endpoint, agent.base_url);
    assert_eq!(remote.capabilities.len(), 3);
    assert!(remote.has_capability("get_forecast"));
    assert!(remote.supported_methods.iter().any(|m| m == "submit_task"));

    assert_eq!(client.discovered(), vec![remote.clone()]);
    assert_eq!(client.agents_with_capability("get_forecast"), vec![remote]);
    assert!(client.agents_with_capability("translate").is_empty());
}

#[tokio::test]
async fn discover_all_skips_unreachable_agents() {
    let agent = LiveAgent::start().await;
    let down = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/agent.json"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&down)
        .await;

    let client = client();
    let found = client.discover_all(&[agent.base_url.as_str(), &down.uri()]).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].endpoint, agent.base_url);
    assert!(client.agent("weather-agent-001").is_some());
}

#[tokio::test]
async fn synchronous_capability_call_returns_the_result() {
    let agent = LiveAgent::start().await;
    let client = client();

    let info = client.get_agent_info(&agent.base_url).await.unwrap();
    assert_eq!(info["id"], "weather-agent-001");

    let weather = client
        .execute(&agent.base_url, "get_current_weather", json!({"location": "Madrid"}))
        .await
        .unwrap();
    assert_eq!(weather["location"]["name"], "Madrid");

    let err = client
        .execute(&agent.base_url, "get_forecast", json!({"location": "Madrid", "days": 99}))
        .await
        .unwrap_err();
    assert!(matches!(err, A2aClientError::Rpc { code: -32602, .. }), "{err:?}");
}

#[tokio::test]
async fn task_round_trip_through_a_live_agent() {
    let agent = LiveAgent::start().await;
    let client = client();

    let task_id = client
        .submit_task(
            &agent.base_url,
            "get_forecast",
            json!({"location": "Sevilla", "days": 2}),
            TaskOptions {
                priority: Some(3),
                timeout_seconds: Some(30),
            },
        )
        .await
        .unwrap();

    let task = client
        .wait_for_task(&agent.base_url, &task_id, quick_wait())
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.priority, 3);
    assert_eq!(task.timeout_seconds, 30);
    assert_eq!(task.agent_id, "agent:planner-7");
    assert_eq!(task.result.unwrap()["forecast"].as_array().unwrap().len(), 2);

    let result = client
        .execute_as_task(&agent.base_url, "get_current_weather", json!({"location": "Madrid"}), quick_wait())
        .await
        .unwrap();
    assert_eq!(result["location"]["name"], "Madrid");
}

#[tokio::test]
async fn rpc_error_member_surfaces_as_rpc_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(header("x-agent-id", "planner-7"))
        .and(body_partial_json(json!({"jsonrpc": "2.0", "method": "teleport", "id": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "error": {"code": -32601, "message": "Method not found", "data": {"method": "teleport"}},
            "id": 1
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client().call(&server.uri(), "teleport", json!({})).await.unwrap_err();
    let A2aClientError::Rpc { code, message, data } = err else {
        panic!("expected an rpc error, got {err:?}");
    };
    assert_eq!(code, -32601);
    assert_eq!(message, "Method not found");
    assert_eq!(data.unwrap()["method"], "teleport");
}

#[tokio::test]
async fn response_for_another_request_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(rpc_result(42, json!({"ok": true})))
        .mount(&server)
        .await;

    let err = client().call(&server.uri(), "get_agent_info", json!({})).await.unwrap_err();
    assert!(matches!(err, A2aClientError::InvalidResponse(_)), "{err:?}");
}

#[tokio::test]
async fn http_failure_keeps_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;

    let err = client().call(&server.uri(), "get_agent_info", json!({})).await.unwrap_err();
    let A2aClientError::Status { status, body } = err else {
        panic!("expected a status error, got {err:?}");
    };
    assert_eq!(status, 503);
    assert_eq!(body, "upstream overloaded");
}

#[tokio::test]
async fn failed_task_is_reported_with_its_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "submit_task"})))
        .respond_with(rpc_result(1, json!({"task_id": "t-1", "status": "submitted"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "get_task_status", "params": {"task_id": "t-1"}})))
        .respond_with(rpc_result(
            2,
            json!({
                "task_id": "t-1",
                "agent_id": "agent:planner-7",
                "capability": "get_forecast",
                "input_data": {"location": "Atlantis"},
                "status": "failed",
                "priority": 0,
                "timeout_seconds": 300,
                "error": {"kind": "execution", "message": "Location not found"},
                "created_at": "2026-10-16T12:00:00Z",
                "updated_at": "2026-10-16T12:00:01Z",
                "completed_at": "2026-10-16T12:00:01Z"
            }),
        ))
        .mount(&server)
        .await;

    let err = client()
        .execute_as_task(&server.uri(), "get_forecast", json!({"location": "Atlantis"}), quick_wait())
        .await
        .unwrap_err();
    let A2aClientError::TaskFailed { task_id, failure } = err else {
        panic!("expected a failed task, got {err:?}");
    };
    assert_eq!(task_id.to_string(), "t-1");
    let failure = failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Execution);
    assert_eq!(failure.message, "Location not found");
}

#[tokio::test]
async fn waiting_gives_up_on_a_task_that_never_finishes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(|req: &wiremock::Request| {
            let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "result": {
                    "task_id": "t-9",
                    "agent_id": "agent:planner-7",
                    "capability": "get_forecast",
                    "input_data": {},
                    "status": "working",
                    "priority": 0,
                    "timeout_seconds": 300,
                    "created_at": "2026-10-16T12:00:00Z",
                    "updated_at": "2026-10-16T12:00:00Z"
                },
                "id": body["id"]
            }))
        })
        .mount(&server)
        .await;

    let policy = WaitPolicy {
        max_wait: Duration::from_millis(100),
        poll_interval: Duration::from_millis(30),
    };
    let err = client()
        .wait_for_task(&server.uri(), &"t-9".into(), policy)
        .await
        .unwrap_err();
    assert!(matches!(err, A2aClientError::WaitTimedOut(ref id) if id.to_string() == "t-9"), "{err:?}");

    let polls = server.received_requests().await.unwrap().len();
    assert!((2..=5).contains(&polls), "polled {polls} times");
}
