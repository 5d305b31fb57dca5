use axum::{extract::State, http::HeaderMap, Json};
use std::time::Duration;

use crate::api::handlers::AppState;
use crate::api::middleware::{identity_from_headers, AppError};
use crate::models::{Query, QueryRequest, QueryResponse};
use crate::services::{CacheKey, DatabaseConnector};
use crate::validation::SqlValidator;

/// Cache partition for raw SQL requests
const SQL_MODE: &str = "sql";

/// Execute a SELECT statement, serving repeated requests from the response cache
pub async fn execute_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let sql = payload.sql.trim();
    if sql.is_empty() {
        return Err(AppError::Validation("SQL query cannot be empty".to_string()));
    }
    SqlValidator::validate_select_only(sql)?;

    let identity = identity_from_headers(&headers);
    tracing::info!("Executing SQL query for {}", identity);

    // The raw statement keeps the key exact; string literals are case-sensitive
    let key = CacheKey::new(sql, &identity, SQL_MODE)
        .with_extra("statement", sql)
        .with_extra("backend", state.connector.db_type().as_str());
    let ttl = payload.cache_ttl_secs.map(Duration::from_secs);

    let (query, cache_hit) = state
        .response_cache
        .get_or_try_insert_with(&key, ttl, || run_query(&state.connector, sql))
        .await?;

    Ok(Json(QueryResponse { query, cache_hit }))
}

async fn run_query(connector: &DatabaseConnector, sql: &str) -> Result<Query, AppError> {
    let mut query = Query::new(sql.to_string());
    let prepared = connector.prepare_sql(sql)?;

    let result = connector.execute_prepared(&prepared).await?;
    if prepared != sql {
        query.executed_sql = Some(prepared);
    }
    query.mark_completed(result.rows, result.execution_time_ms);
    Ok(query)
}
