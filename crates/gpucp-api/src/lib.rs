//! Thin HTTP surface over the control plane's [`gpucp_core::ServiceRegistry`].
//! Runs as its own process so the daemon's job-processing loop never
//! shares a tokio runtime with request handling.

pub mod auth;
pub mod context;
pub mod error;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod metrics_middleware;
pub mod state;

use axum::routing::{get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::ApiState;

/// Assembles the public probes plus the credentialed `/api/*` surface.
/// Auth is enforced per-handler via the [`auth::ApiCredential`]
/// extractor rather than a blanket middleware layer, so a handler
/// signature alone documents whether it requires a credential.
pub fn build_router(state: ApiState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/live", get(health::liveness_check));

    let instance_routes = Router::new()
        .route(
            "/api/instances",
            post(handlers::instances::create_instance).get(handlers::instances::list_instances),
        )
        .route(
            "/api/instances/comprehensive",
            get(handlers::instances::comprehensive_list),
        )
        .route("/api/instances/{id}", get(handlers::instances::get_instance))
        .route(
            "/api/instances/{id}/start",
            post(handlers::instances::start_instance_by_id),
        )
        .route(
            "/api/instances/start",
            post(handlers::instances::start_instance_by_name),
        )
        .route(
            "/api/instances/{id}/stop",
            post(handlers::instances::stop_instance_by_id),
        )
        .route(
            "/api/instances/stop",
            post(handlers::instances::stop_instance_by_name),
        )
        .route(
            "/api/instances/{id}/last-used",
            put(handlers::instances::touch_last_used),
        )
        .route(
            "/api/instances/auto-stop/stats",
            get(handlers::auto_stop::stats),
        )
        .route(
            "/api/instances/auto-stop/trigger",
            post(handlers::auto_stop::trigger),
        );

    let migration_routes = Router::new()
        .route("/api/migration/status", get(handlers::migration::status))
        .route("/api/migration/history", get(handlers::migration::history))
        .route("/api/migration/trigger", post(handlers::migration::trigger));

    let api_routes = Router::new()
        .merge(instance_routes)
        .merge(migration_routes);

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(metrics_middleware::track_metrics))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

pub fn build_metrics_router() -> Router {
    Router::new().route("/metrics", get(health::metrics_handler))
}
