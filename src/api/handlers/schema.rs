use axum::{
    extract::{Query, State},
    Json,
};

use crate::api::handlers::AppState;
use crate::models::SchemaQueryParams;

/// Schema description served to the agent layer
pub async fn get_schema(
    State(state): State<AppState>,
    Query(params): Query<SchemaQueryParams>,
) -> Json<serde_json::Value> {
    if params.refresh {
        tracing::info!("Force refreshing schema");
    }
    let view = state.connector.schema_info(params.refresh).await;
    let discovered_at = state
        .connector
        .schema_cache()
        .snapshot()
        .map(|snapshot| snapshot.discovered_at);

    Json(serde_json::json!({
        "schema": view.schema_text,
        "tables": view.table_names,
        "source": view.source,
        "discovered_at": discovered_at,
    }))
}
