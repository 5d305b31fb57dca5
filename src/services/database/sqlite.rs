// SQLite backend (embedded engine) built on rusqlite
use crate::api::middleware::AppError;
use crate::services::database::adapter::{Connection, ConnectionFactory, QueryResult};
use crate::services::database::DatabaseType;
use rusqlite::types::ValueRef;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Instant;

/// Opens rusqlite connections to one database file
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    path: PathBuf,
}

impl SqliteConnectionFactory {
    /// Accepts a plain path or a `sqlite:` / `sqlite://` / `sqlite:///` URL
    pub fn new(database_url: &str) -> Result<Self, AppError> {
        let mut cleaned = database_url.trim();
        if let Some(rest) = cleaned.strip_prefix("sqlite:") {
            cleaned = match rest.strip_prefix("//") {
                // sqlite:///sales.db is relative, sqlite:////var/sales.db is absolute
                Some(after) => after.strip_prefix('/').unwrap_or(after),
                None => rest,
            };
        }

        if cleaned.is_empty() {
            return Err(AppError::Validation("SQLite database path cannot be empty".to_string()));
        }

        Ok(Self {
            path: PathBuf::from(cleaned),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>, AppError> {
        let conn = rusqlite::Connection::open(&self.path)
            .map_err(|e| AppError::Connection(format!("Failed to open SQLite database {}: {}", self.path.display(), e)))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        tracing::debug!("Opened SQLite connection to {}", self.path.display());
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }
}

pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

#[async_trait::async_trait]
impl Connection for SqliteConnection {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, AppError> {
        run_statement(&self.conn, sql)
    }

    fn close(self: Box<Self>) -> Result<(), AppError> {
        self.conn
            .close()
            .map_err(|(_, e)| AppError::Connection(format!("Failed to close SQLite connection: {}", e)))
    }
}

fn run_statement(conn: &rusqlite::Connection, sql: &str) -> Result<QueryResult, AppError> {
    let start_time = Instant::now();

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| AppError::Database(format!("Query execution failed: {}", e)))?;
    let column_names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt
        .query([])
        .map_err(|e| AppError::Database(format!("Query execution failed: {}", e)))?;

    let mut json_rows = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| AppError::Database(format!("Query execution failed: {}", e)))?
    {
        let mut row_obj = serde_json::Map::new();
        for (idx, name) in column_names.iter().enumerate() {
            let value = match row.get_ref(idx)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => json!(v),
                ValueRef::Real(v) => json!(v),
                ValueRef::Text(bytes) => json!(String::from_utf8_lossy(bytes)),
                ValueRef::Blob(bytes) => json!(format!("<blob {} bytes>", bytes.len())),
            };
            row_obj.insert(name.clone(), value);
        }
        json_rows.push(Value::Object(row_obj));
    }

    Ok(QueryResult::new(json_rows, start_time.elapsed().as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_factory(dir: &TempDir) -> SqliteConnectionFactory {
        let path = dir.path().join("sales.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL, image BLOB);
             INSERT INTO products (name, price, image) VALUES ('Laptop', 999.99, x'0102');
             INSERT INTO products (name, price, image) VALUES ('Mouse', NULL, NULL);",
        )
        .unwrap();
        SqliteConnectionFactory::new(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_url_prefixes_are_stripped() {
        let factory = SqliteConnectionFactory::new("sqlite:///sales.db").unwrap();
        assert_eq!(factory.path(), std::path::Path::new("sales.db"));

        let factory = SqliteConnectionFactory::new("sqlite:./data/sales.db").unwrap();
        assert_eq!(factory.path(), std::path::Path::new("./data/sales.db"));

        let factory = SqliteConnectionFactory::new("sqlite:////var/lib/sales.db").unwrap();
        assert_eq!(factory.path(), std::path::Path::new("/var/lib/sales.db"));

        assert!(SqliteConnectionFactory::new("sqlite://").is_err());
    }

    #[tokio::test]
    async fn test_execute_converts_rows_to_json() {
        let dir = TempDir::new().unwrap();
        let factory = seeded_factory(&dir);

        let mut conn = factory.connect().await.unwrap();
        let result = conn
            .execute("SELECT id, name, price, image FROM products ORDER BY id")
            .await
            .unwrap();

        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0]["name"], "Laptop");
        assert_eq!(result.rows[0]["price"], 999.99);
        assert_eq!(result.rows[0]["image"], "<blob 2 bytes>");
        assert!(result.rows[1]["price"].is_null());
        assert_eq!(result.text(1, "name"), Some("Mouse"));

        assert!(conn.close().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_sql_is_a_database_error() {
        let dir = TempDir::new().unwrap();
        let factory = seeded_factory(&dir);

        let mut conn = factory.connect().await.unwrap();
        let err = conn.execute("SELECT * FROM missing_table").await.unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
    }
}
