//! Entry point for the HTTP API process. Builds its own copy of the
//! service registry (store, queue, provider client, webhook dispatcher)
//! but never calls `ServiceRegistry::run`: job processing and the
//! schedulers stay exclusively in `gpucp-core`'s own process.

use std::sync::Arc;

use anyhow::{Context, Result};
use gpucp_api::state::ApiState;
use gpucp_config::Config;
use gpucp_core::ServiceRegistry;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    gpucp_common::init_tracing();

    info!("starting gpu instance control plane api");

    let config = Config::load().context("failed to load configuration")?;
    let host = config.api.host.clone();
    let port = config.api.port;
    let metrics_port = config.api.metrics_port;

    let registry = ServiceRegistry::build(config)
        .await
        .context("failed to build service registry")?;

    let state = ApiState::new(Arc::clone(&registry));
    state.mark_ready();

    let app = gpucp_api::build_router(state);
    let metrics_app = gpucp_api::build_metrics_router();

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind api server to {addr}"))?;

    let metrics_addr = format!("{host}:{metrics_port}");
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {metrics_addr}"))?;

    info!(addr, "api server listening");
    info!(addr = %metrics_addr, "metrics server listening");

    tokio::select! {
        res = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()) => {
            if let Err(e) = res {
                error!(error = %e, "api server exited with an error");
            }
        }
        res = axum::serve(metrics_listener, metrics_app).with_graceful_shutdown(shutdown_signal()) => {
            if let Err(e) = res {
                error!(error = %e, "metrics server exited with an error");
            }
        }
    }

    info!("gpu instance control plane api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
