use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::{health, query, schema, stats, AppState};
use crate::api::middleware::rate_limit;

/// Create router with application state
pub fn create_router(state: AppState) -> Router {
    // Only query execution spends rate-limit budget
    let limited = Router::new()
        .route("/api/query", post(query::execute_query))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/schema", get(schema::get_schema))
        .route("/api/rate-limit/status", get(stats::rate_limit_status))
        .route("/api/stats", get(stats::get_stats))
        .route("/api/cache", delete(stats::clear_cache))
        .merge(limited)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
