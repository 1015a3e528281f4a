//! Metrics and health endpoint
//!
//! Provides:
//! - `/health`: bus connection state and live subscription count
//! - `/metrics`: Prometheus text (dispatch and bus counters)
//! - `/subscriptions`: JSON snapshot of the live registry

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chanbridge_core::{Dispatcher, RegistrySnapshot};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::config::MetricsConfig;

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub bus: String,
    pub live_subscriptions: usize,
}

async fn health(State(dispatcher): State<Arc<Dispatcher>>) -> (StatusCode, Json<HealthResponse>) {
    let bus = dispatcher.connection_state();
    let (code, status) = if bus.is_connected() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            bus: bus.to_string(),
            live_subscriptions: dispatcher.snapshot().len(),
        }),
    )
}

async fn metrics(State(dispatcher): State<Arc<Dispatcher>>) -> String {
    dispatcher.export_prometheus()
}

async fn subscriptions(State(dispatcher): State<Arc<Dispatcher>>) -> Json<RegistrySnapshot> {
    Json(dispatcher.snapshot())
}

/// Create metrics routes
pub fn metrics_routes(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/subscriptions", get(subscriptions))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Bind the metrics listener; failing to bind is a startup error
pub async fn bind(config: &MetricsConfig) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid metrics address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics address")?;
    info!("Metrics endpoint listening on http://{}", addr);
    Ok(listener)
}

/// Serve the metrics routes until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, metrics_routes(dispatcher))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Metrics server error")?;
    Ok(())
}
