use axum::{extract::State, Json};
use chrono::Utc;

use crate::api::handlers::AppState;

/// Health check endpoint; `degraded` when the database probe fails
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let healthy = state.connector.is_healthy().await;

    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "database": state.connector.db_type().as_str(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
