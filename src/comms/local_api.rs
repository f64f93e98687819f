use anyhow::{Context, Result};
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::agent::config::Config;
use crate::commands::CommandExecutor;
use crate::comms::broker::{Broker, Subscription};
use crate::monitoring::{spawn_log_producer, spawn_stats_producer, MetricsCollector, ProducerHandles};
use crate::transport::{CommandRequest, RunResponse, Topic};

type SharedState = Arc<AppState>;

#[derive(Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub executor: CommandExecutor,
    pub broker: Arc<Broker>,
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let broker = Arc::new(Broker::new(config.telemetry.queue_capacity));
        Self::with_broker(config, broker)
    }

    pub fn with_broker(config: Arc<Config>, broker: Arc<Broker>) -> Self {
        Self {
            executor: CommandExecutor::from_config(&config.command),
            keep_alive: config.telemetry.keep_alive(),
            broker,
            config,
        }
    }
}

// Health check
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn run_command(
    State(state): State<SharedState>,
    Json(req): Json<CommandRequest>,
) -> Json<RunResponse> {
    let result = state.executor.execute(&req).await;
    debug!(
        status = result.status.as_str(),
        elapsed = result.elapsed_seconds,
        "run request finished"
    );
    Json(result.to_response())
}

async fn logs_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_response(state.broker.subscribe(Topic::Logs), state.keep_alive)
}

async fn stats_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_response(state.broker.subscribe(Topic::Stats), state.keep_alive)
}

/// Turn a subscription into an SSE body. The subscription (and its queue)
/// is released when axum drops the stream on disconnect.
fn sse_response(
    subscription: Subscription,
    keep_alive: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(topic = %subscription.topic(), subscriber = subscription.id(), "stream opened");
    let stream = subscription.into_stream().map(|event| {
        Ok(match Event::default().json_data(event.as_ref()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode telemetry event: {}", e);
                Event::default().comment("encoding error")
            }
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive))
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(run_command))
        .route("/logs", get(logs_stream))
        .route("/stats", get(stats_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the producers and serve HTTP until Ctrl-C.
pub async fn serve(config: Config, port: u16) -> Result<()> {
    let cfg = Arc::new(config);
    let state = Arc::new(AppState::new(cfg.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sampler = Arc::new(MetricsCollector::new());
    let producers = ProducerHandles {
        logs: spawn_log_producer(
            sampler.clone(),
            state.broker.clone(),
            cfg.telemetry.log_interval(),
            shutdown_rx.clone(),
        ),
        stats: spawn_stats_producer(
            sampler,
            state.broker.clone(),
            cfg.telemetry.stats_interval(),
            shutdown_rx,
        ),
    };

    let app = create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("HTTP server listening on {}", addr);

    let broker = state.broker.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutdown signal received, stopping producers");
            let _ = shutdown_tx.send(true);
            // Open event streams never finish on their own.
            broker.close();
        })
        .await
        .context("HTTP server error")?;

    producers.join().await;
    info!("server stopped");
    Ok(())
}
