//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Health check (intentionally unauthenticated for load balancer probes)
        .route("/v1/health", get(handlers::health_check))
        // Upload control plane
        .route(
            "/v1/uploads",
            post(handlers::create_upload).get(handlers::list_uploads),
        )
        .route(
            "/v1/uploads/{upload_id}",
            get(handlers::get_upload).delete(handlers::abort_upload),
        )
        .route(
            "/v1/uploads/{upload_id}/chunks/{chunk_index}",
            put(handlers::write_chunk),
        )
        .route(
            "/v1/uploads/{upload_id}/complete",
            post(handlers::complete_upload),
        )
        .route("/v1/quota", get(handlers::get_quota))
        // Admin endpoints (require an admin token)
        .route("/v1/admin/reaper/run", post(handlers::run_reaper))
        .route("/v1/admin/reaper/runs", get(handlers::list_reaper_runs));

    let mut router = Router::new().merge(api_routes);

    // When enabled, /metrics must be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
