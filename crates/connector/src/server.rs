use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::connection::ConnectionManager;
use crate::endpoint::StreamTarget;
use crate::latency::LatencyAggregator;
use crate::metrics;
use crate::types::{ConnectionStatus, MetricsSnapshot};

#[derive(Debug, Serialize)]
pub struct StreamHealth {
    pub stream: String,
    pub status: ConnectionStatus,
    pub reconnect_attempt: u32,
    pub last_activity_at: u64,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub streams: Vec<StreamHealth>,
}

/// Shared state for health endpoints
#[derive(Clone)]
pub struct ServerState {
    name: Arc<str>,
    manager: ConnectionManager,
    latency: LatencyAggregator,
    /// Streams that must be connected for `/ready`
    required: Arc<[StreamTarget]>,
}

impl ServerState {
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        latency: LatencyAggregator,
        required: Vec<StreamTarget>,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            manager,
            latency,
            required: required.into(),
        }
    }

    fn streams(&self) -> Vec<StreamHealth> {
        let mut streams: Vec<StreamHealth> = self
            .manager
            .states()
            .into_iter()
            .map(|(target, state)| StreamHealth {
                stream: target.to_string(),
                status: state.status,
                reconnect_attempt: state.reconnect_attempt,
                last_activity_at: state.last_activity_at,
            })
            .collect();
        // required streams never attempted still show up
        for target in self.required.iter() {
            let name = target.to_string();
            if !streams.iter().any(|s| s.stream == name) {
                streams.push(StreamHealth {
                    stream: name,
                    status: ConnectionStatus::Disconnected,
                    reconnect_attempt: 0,
                    last_activity_at: 0,
                });
            }
        }
        streams
    }

    fn is_ready(&self) -> bool {
        crate::client::required_ready(&self.manager, &self.required)
    }
}

/// Health endpoint - always returns 200 if server is running
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        name: state.name.to_string(),
        streams: state.streams(),
    })
}

/// Ready endpoint - returns 200 only when every required stream is connected
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let ready = state.is_ready();
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            name: state.name.to_string(),
            streams: state.streams(),
        }),
    )
}

/// Prometheus text exposition
async fn prometheus_metrics() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn latency(State(state): State<ServerState>) -> Json<MetricsSnapshot> {
    Json(state.latency.snapshot())
}

/// Create the health server router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .route("/latency", get(latency))
        .with_state(state)
}

/// Run the health server until shutdown
pub async fn run_server(
    addr: SocketAddr,
    state: ServerState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
}
