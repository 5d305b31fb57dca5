// Database abstraction layer: capability traits plus one module per backend
pub mod adapter;
pub mod postgresql;
pub mod sqlite;

pub use adapter::{Connection, ConnectionFactory, QueryExecutor, QueryResult};
pub use postgresql::PostgresConnectionFactory;
pub use sqlite::SqliteConnectionFactory;

use crate::api::middleware::AppError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Database type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
    PostgreSQL,
}

impl DatabaseType {
    pub fn from_str(s: &str) -> Result<Self, AppError> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(DatabaseType::Sqlite),
            "postgresql" | "postgres" => Ok(DatabaseType::PostgreSQL),
            _ => Err(AppError::Validation(format!("Unsupported database type: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::PostgreSQL => "postgresql",
        }
    }

    /// Human-readable dialect name used in schema descriptions
    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "SQLite",
            DatabaseType::PostgreSQL => "PostgreSQL",
        }
    }
}

/// Factory function to create the connection factory for a backend.
/// The backend is fixed at construction; nothing downstream inspects it at runtime.
pub fn create_connection_factory(
    db_type: DatabaseType,
    connection_url: &str,
) -> Result<Arc<dyn ConnectionFactory>, AppError> {
    match db_type {
        DatabaseType::Sqlite => Ok(Arc::new(SqliteConnectionFactory::new(connection_url)?)),
        DatabaseType::PostgreSQL => Ok(Arc::new(PostgresConnectionFactory::new(connection_url)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_parsing() {
        assert_eq!(DatabaseType::from_str("SQLite").unwrap(), DatabaseType::Sqlite);
        assert_eq!(DatabaseType::from_str("postgres").unwrap(), DatabaseType::PostgreSQL);
        assert!(DatabaseType::from_str("databricks").is_err());
    }

    #[test]
    fn test_factory_matches_requested_backend() {
        let factory = create_connection_factory(DatabaseType::Sqlite, "sales.db").unwrap();
        assert_eq!(factory.database_type(), DatabaseType::Sqlite);

        assert!(create_connection_factory(DatabaseType::PostgreSQL, "sales.db").is_err());
    }
}
