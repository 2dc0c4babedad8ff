use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method, header};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use clima_agent::config::AgentConfig;
use clima_agent::dispatcher::Dispatcher;
use clima_agent::handlers::AGENT_ID_HEADER;
use clima_agent::reasoner::{OpenAiReasoner, Reasoner};
use clima_agent::state::AppState;
use clima_agent::sweeper;
use clima_agent::tasks::FailureKind;
use clima_agent::tasks::worker;
use clima_agent::weather::OpenMeteoClient;

const DRAIN_POLL: Duration = Duration::from_millis(100);
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(5);

fn build_app(state: &AppState) -> axum::Router {
    let config = &state.config;

    // Security headers
    let nosniff: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );

    let mut app = clima_agent::create_router(state.clone())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(nosniff);

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(AGENT_ID_HEADER)])
            .max_age(Duration::from_secs(86_400));
        app = app.layer(cors);
    }

    app.layer(
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
            )
        }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    let config = Arc::new(AgentConfig::from_env()?);

    let weather = Arc::new(OpenMeteoClient::new(&config.weather)?);
    let reasoner: Option<Arc<dyn Reasoner>> = match &config.reasoner {
        Some(rc) => {
            tracing::info!("startup: natural-language queries enabled (model={})", rc.model);
            Some(Arc::new(OpenAiReasoner::new(rc)?))
        }
        None => {
            tracing::info!("startup: OPENAI_API_KEY not set, process_query disabled");
            None
        }
    };
    let dispatcher = Arc::new(Dispatcher::from_config(&config, weather, reasoner)?);
    let state = AppState::new(config.clone(), dispatcher.clone());

    // ── Background workers ──
    let shutdown = CancellationToken::new();
    let workers = worker::spawn_workers(config.tasks.workers, dispatcher.clone(), shutdown.clone());
    let sweeper = sweeper::spawn(dispatcher.clone(), config.tasks, shutdown.clone());

    let app = build_app(&state);
    state.mark_ready();

    let addr: SocketAddr = config.bind_addr().parse()?;
    tracing::info!(
        "{} ({}) listening on http://{}",
        config.agent_name,
        config.agent_id,
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let draining_state = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        draining_state.mark_draining();
        draining_state.dispatcher.tasks().close();
    })
    .await?;

    // ── Drain ──
    let tasks = dispatcher.tasks().clone();
    let drained = tokio::time::timeout(config.tasks.shutdown_drain, async {
        while tasks.active() > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    })
    .await
    .is_ok();
    if !drained {
        tracing::warn!(
            "shutdown: {} tasks still active after {}s drain",
            tasks.active(),
            config.tasks.shutdown_drain.as_secs()
        );
    }

    shutdown.cancel();
    // In-flight calls are left to the runtime after the grace period.
    if tokio::time::timeout(WORKER_JOIN_GRACE, futures_util::future::join_all(workers))
        .await
        .is_err()
    {
        tracing::warn!("shutdown: workers still busy, abandoning in-flight calls");
    }
    let _ = sweeper.await;

    let abandoned = tasks.fail_unfinished(FailureKind::Shutdown, "Agent shut down before the task finished");
    tracing::info!("shutdown: complete (abandoned_tasks={})", abandoned);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
