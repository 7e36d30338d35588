//! HTTP routing.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the application router with all routes.
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new().route("/health", get(handlers::health_check));

    let flow_routes = Router::new()
        .route("/api/flows/{flow_id}/execute", post(handlers::execute))
        .route(
            "/api/flows/{flow_id}/executions",
            get(handlers::executions::list),
        );

    let execution_routes = Router::new()
        .route(
            "/api/executions/{execution_id}",
            get(handlers::executions::get),
        )
        .route(
            "/api/executions/{execution_id}/retry",
            post(handlers::executions::retry),
        )
        .route("/api/jobs/{job_id}", get(handlers::jobs::get));

    let database_routes =
        Router::new().route("/api/db/init", post(handlers::database::init_database));

    Router::new()
        .merge(health_routes)
        .merge(flow_routes)
        .merge(execution_routes)
        .merge(database_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
