use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One executed SQL statement, as returned to API callers
/// and stored in the response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub query_text: String,
    /// SQL actually sent to the backend after table qualification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_sql: Option<String>,
    pub status: QueryStatus,
    pub results: Option<Vec<serde_json::Value>>,
    pub row_count: Option<usize>,
    pub execution_time_ms: Option<u64>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Completed,
}

impl Query {
    pub fn new(query_text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            query_text,
            executed_sql: None,
            status: QueryStatus::Pending,
            results: None,
            row_count: None,
            execution_time_ms: None,
            executed_at: None,
        }
    }

    pub fn mark_completed(&mut self, results: Vec<serde_json::Value>, execution_time_ms: u64) {
        self.status = QueryStatus::Completed;
        self.row_count = Some(results.len());
        self.results = Some(results);
        self.execution_time_ms = Some(execution_time_ms);
        self.executed_at = Some(Utc::now());
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    /// Override for the response cache TTL, in seconds
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub query: Query,
    pub cache_hit: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SchemaQueryParams {
    #[serde(default)]
    pub refresh: bool,
}
