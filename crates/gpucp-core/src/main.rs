//! Control-plane daemon entry point: loads configuration, builds the
//! service registry, starts the health/readiness server, and runs
//! until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use gpucp_config::Config;
use gpucp_core::ServiceRegistry;
use serde_json::{json, Value};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    gpucp_common::init_tracing();

    info!("starting gpu instance control plane");

    let config = Config::load().context("failed to load configuration")?;
    let metrics_port = config.observability.metrics_port;
    let bind_host = config.bind.host.clone();
    let bind_port = config.bind.port;

    let registry = ServiceRegistry::build(config)
        .await
        .context("failed to build service registry")?;

    {
        let registry = Arc::clone(&registry);
        let addr = format!("{bind_host}:{bind_port}");
        tokio::spawn(async move {
            if let Err(e) = start_health_server(addr, registry).await {
                error!(error = %e, "health server exited");
            }
        });
    }

    {
        let addr = format!("0.0.0.0:{metrics_port}");
        tokio::spawn(async move {
            let app = Router::new().route("/metrics", get(metrics));
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "metrics server exited");
                    }
                }
                Err(e) => error!(error = %e, addr, "failed to bind metrics server"),
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let run_handle = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.run(shutdown_rx).await })
    };

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    match run_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "service registry exited with an error"),
        Err(e) => error!(error = %e, "service registry task panicked"),
    }

    info!("gpu instance control plane stopped");
    Ok(())
}

async fn start_health_server(addr: String, registry: Arc<ServiceRegistry>) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind health server to {addr}"))?;

    info!(addr, "health server listening");
    axum::serve(listener, app).await.context("health server failed")?;
    Ok(())
}

async fn metrics() -> (StatusCode, String) {
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to render metrics".to_string(),
            )
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "gpucp-core",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready(State(registry): State<Arc<ServiceRegistry>>) -> (StatusCode, Json<Value>) {
    if registry.is_ready() {
        (StatusCode::OK, Json(json!({ "ready": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false })),
        )
    }
}
