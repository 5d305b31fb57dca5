// Capability traits shared by every database backend
use crate::api::middleware::AppError;
use crate::services::database::DatabaseType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query execution result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// One JSON object per row, keyed by column name
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn new(rows: Vec<Value>, execution_time_ms: u64) -> Self {
        Self {
            row_count: rows.len(),
            rows,
            execution_time_ms,
        }
    }

    /// Read a text column from the given row, if present
    pub fn text(&self, row: usize, column: &str) -> Option<&str> {
        self.rows.get(row)?.get(column)?.as_str()
    }
}

/// A single live database connection.
///
/// A connection is used by exactly one caller at a time, hence `&mut self`.
#[async_trait::async_trait]
pub trait Connection: Send {
    /// Execute one SQL statement and collect all rows
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, AppError>;

    /// Close the connection. Errors are reported, never panicked on.
    fn close(self: Box<Self>) -> Result<(), AppError>;
}

/// Opens new connections for the pool
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, AppError>;

    fn database_type(&self) -> DatabaseType;
}

/// Anything that can run a SQL statement on demand, such as a pool that
/// checks a connection out for the duration of the statement.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryResult, AppError>;
}
