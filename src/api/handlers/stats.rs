use axum::{extract::State, http::HeaderMap, Json};

use crate::api::handlers::AppState;
use crate::api::middleware::identity_from_headers;
use crate::services::RateLimitStatus;

/// Pool, cache and rate limiter counters
pub async fn get_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "database": state.connector.db_type().as_str(),
        "pool": state.connector.pool().stats(),
        "cache": state.response_cache.stats(),
        "rate_limiter": {
            "tracked_identities": state.rate_limiter.tracked_identities(),
            "limits": state.rate_limiter.config(),
        },
    }))
}

/// The caller's current rate limit usage
pub async fn rate_limit_status(State(state): State<AppState>, headers: HeaderMap) -> Json<RateLimitStatus> {
    let identity = identity_from_headers(&headers);
    Json(state.rate_limiter.status(&identity))
}

/// Drop every cached response
pub async fn clear_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.response_cache.invalidate(None);
    Json(serde_json::json!({ "removed": removed }))
}
