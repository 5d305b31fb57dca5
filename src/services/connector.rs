use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::api::middleware::AppError;
use crate::services::connection_pool::{ConnectionPool, PoolConfig};
use crate::services::database::{create_connection_factory, ConnectionFactory, DatabaseType, QueryExecutor, QueryResult};
use crate::services::schema_cache::{DiscoveryDialect, SchemaDiscoveryCache, SchemaView};
use crate::validation::SqlValidator;

/// How long a health probe result is reused
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on waiting for a connection during a health probe
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema used for PostgreSQL discovery when none is configured
const DEFAULT_POSTGRES_SCHEMA: &str = "public";

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Namespace prepended to bare references to `tables`
    pub qualifier: Option<String>,
    /// Known analytics tables
    pub tables: Vec<String>,
    pub schema_cache_ttl: Duration,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            qualifier: None,
            tables: vec!["products".to_string(), "sales".to_string()],
            schema_cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthProbe {
    healthy: bool,
    checked_at: Instant,
}

/// One analytics database: its pool, schema cache and SQL preparation.
pub struct DatabaseConnector {
    db_type: DatabaseType,
    pool: ConnectionPool,
    schema_cache: SchemaDiscoveryCache,
    qualifier: Option<String>,
    tables: Vec<String>,
    health: Mutex<Option<HealthProbe>>,
}

impl DatabaseConnector {
    pub fn new(factory: Arc<dyn ConnectionFactory>, pool_config: PoolConfig, options: ConnectorOptions) -> Self {
        let db_type = factory.database_type();
        let dialect = match db_type {
            DatabaseType::Sqlite => DiscoveryDialect::Sqlite,
            DatabaseType::PostgreSQL => DiscoveryDialect::Postgres {
                schema: options
                    .qualifier
                    .clone()
                    .unwrap_or_else(|| DEFAULT_POSTGRES_SCHEMA.to_string()),
                tables: options.tables.clone(),
            },
        };

        tracing::info!("Initializing {} connector", db_type.display_name());
        Self {
            db_type,
            pool: ConnectionPool::new(factory, pool_config),
            schema_cache: SchemaDiscoveryCache::new(dialect, options.schema_cache_ttl),
            qualifier: options.qualifier.filter(|q| !q.trim().is_empty()),
            tables: options.tables,
            health: Mutex::new(None),
        }
    }

    /// Build the backend selected by `db_type` for `url`
    pub fn connect(
        db_type: DatabaseType,
        url: &str,
        pool_config: PoolConfig,
        options: ConnectorOptions,
    ) -> Result<Self, AppError> {
        let factory = create_connection_factory(db_type, url)?;
        Ok(Self::new(factory, pool_config, options))
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn known_tables(&self) -> &[String] {
        &self.tables
    }

    /// Rewrite `sql` into the form sent to the backend
    pub fn prepare_sql(&self, sql: &str) -> Result<String, AppError> {
        match &self.qualifier {
            Some(qualifier) => SqlValidator::qualify_table_names(sql, &self.tables, qualifier),
            None => Ok(sql.to_string()),
        }
    }

    /// Run SQL that already went through [`DatabaseConnector::prepare_sql`]
    pub async fn execute_prepared(&self, sql: &str) -> Result<QueryResult, AppError> {
        self.pool.execute(sql).await
    }

    pub async fn execute_query(&self, sql: &str) -> Result<QueryResult, AppError> {
        let prepared = self.prepare_sql(sql)?;
        self.execute_prepared(&prepared).await
    }

    pub async fn schema_info(&self, force_refresh: bool) -> SchemaView {
        // Catalog queries are already qualified, so they bypass prepare_sql
        self.schema_cache.describe(&self.pool, force_refresh).await
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.schema_info(false).await.table_names
    }

    pub fn schema_cache(&self) -> &SchemaDiscoveryCache {
        &self.schema_cache
    }

    /// Probe the database with `SELECT 1`, reusing the last result for a minute
    pub async fn is_healthy(&self) -> bool {
        if let Some(probe) = *self.health.lock() {
            if probe.checked_at.elapsed() < HEALTH_CHECK_INTERVAL {
                return probe.healthy;
            }
        }

        let healthy = match self.pool.acquire_until(Instant::now() + HEALTH_CHECK_TIMEOUT).await {
            Ok(mut conn) => match conn.execute("SELECT 1 AS test").await {
                Ok(result) => result.row_count > 0,
                Err(e) => {
                    tracing::warn!("{} health check failed: {}", self.db_type.display_name(), e);
                    false
                }
            },
            Err(e) => {
                tracing::warn!("{} health check failed: {}", self.db_type.display_name(), e);
                false
            }
        };

        *self.health.lock() = Some(HealthProbe {
            healthy,
            checked_at: Instant::now(),
        });
        healthy
    }

    /// Close the pool. Safe to call more than once.
    pub fn close(&self) -> usize {
        self.pool.close()
    }
}

#[async_trait::async_trait]
impl QueryExecutor for DatabaseConnector {
    async fn execute(&self, sql: &str) -> Result<QueryResult, AppError> {
        self.execute_query(sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::schema_cache::SchemaSource;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn seeded_database(dir: &TempDir) -> String {
        let path = dir.path().join("sales.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, category TEXT, price REAL);
             CREATE TABLE sales (id INTEGER PRIMARY KEY, product_id INTEGER, quantity INTEGER, total REAL, region TEXT);
             INSERT INTO products (name, category, price) VALUES ('Laptop', 'Electronics', 999.0);
             INSERT INTO sales (product_id, quantity, total, region) VALUES (1, 2, 1998.0, 'North');
             INSERT INTO sales (product_id, quantity, total, region) VALUES (1, 1, 999.0, 'South');",
        )
        .unwrap();
        format!("sqlite:{}", path.display())
    }

    fn connector(url: &str, qualifier: Option<&str>) -> DatabaseConnector {
        DatabaseConnector::connect(
            DatabaseType::Sqlite,
            url,
            PoolConfig::default().with_min_size(1).with_max_size(2),
            ConnectorOptions {
                qualifier: qualifier.map(String::from),
                ..ConnectorOptions::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_query_through_pool() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&seeded_database(&dir), None);

        let result = assert_ok!(connector.execute_query("SELECT region, SUM(total) AS total FROM sales GROUP BY region ORDER BY region").await);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.text(0, "region"), Some("North"));
        assert_eq!(connector.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_qualifier_is_applied_before_execution() {
        let dir = TempDir::new().unwrap();
        // SQLite names the primary database schema "main"
        let connector = connector(&seeded_database(&dir), Some("main"));

        assert_eq!(
            connector.prepare_sql("SELECT COUNT(*) AS n FROM sales").unwrap(),
            "SELECT COUNT(*) AS n FROM main.sales"
        );
        let result = assert_ok!(connector.execute_query("SELECT COUNT(*) AS n FROM sales").await);
        assert_eq!(result.rows[0]["n"], 2);
    }

    #[tokio::test]
    async fn test_schema_info_and_table_names() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&seeded_database(&dir), None);

        let view = connector.schema_info(false).await;
        assert_eq!(view.source, SchemaSource::Discovered);
        assert!(view.schema_text.contains("Table: sales"));
        assert_eq!(connector.table_names().await, vec!["products", "sales"]);
        assert_eq!(connector.schema_info(false).await.source, SchemaSource::Cached);
    }

    #[tokio::test]
    async fn test_health_probe_is_cached() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&seeded_database(&dir), None);

        assert!(connector.is_healthy().await);

        // A closed pool would fail the probe, but the cached result is reused
        connector.close();
        assert!(connector.is_healthy().await);
    }

    #[tokio::test]
    async fn test_closed_connector_is_unhealthy_without_cache() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&seeded_database(&dir), None);

        connector.close();
        assert!(!connector.is_healthy().await);
        assert!(matches!(
            connector.execute_query("SELECT 1").await,
            Err(AppError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let result = DatabaseConnector::connect(
            DatabaseType::PostgreSQL,
            "mysql://localhost/db",
            PoolConfig::default(),
            ConnectorOptions::default(),
        );
        assert!(result.is_err());
    }
}
