// Schema Discovery Cache
//
// Builds the schema description handed to the agent layer from live catalog
// metadata, caches it for a TTL and falls back to a static description when
// discovery fails.

use crate::api::middleware::AppError;
use crate::models::{Column, Table};
use crate::services::database::{QueryExecutor, QueryResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Application tables that are never described to the agent
pub const EXCLUDED_TABLES: &[&str] = &["users", "chat_sessions", "query_history"];

/// Tables assumed by the static fallback descriptions
const FALLBACK_TABLES: &[&str] = &["products", "sales"];

const RELATIONSHIP_HINTS: &[&str] = &["- sales.product_id links to products.id"];

const EXAMPLE_QUERIES: &[&str] = &[
    "- Total sales: SELECT SUM(total) FROM sales",
    "- Sales by region: SELECT region, SUM(total) FROM sales GROUP BY region",
];

pub const SQLITE_FALLBACK: &str = "DATABASE SCHEMA (SQLite):

Table: products
- id (INTEGER, primary key)
- name (TEXT) - product name like 'Laptop', 'Smartphone'
- category (TEXT) - category like 'Electronics', 'Furniture', 'Books'
- price (REAL) - price in dollars

Table: sales
- id (INTEGER, primary key)
- product_id (INTEGER) - references products.id
- quantity (INTEGER) - number of items sold
- total (REAL) - total sale amount in dollars
- sale_date (DATE) - when the sale happened
- region (TEXT) - 'North', 'South', 'East', or 'West'

RELATIONSHIPS:
- sales.product_id links to products.id
- To get product names with sales, JOIN the tables

EXAMPLE QUERIES:
- Total sales: SELECT SUM(total) FROM sales
- Sales by region: SELECT region, SUM(total) FROM sales GROUP BY region
- Top products: SELECT p.name, SUM(s.total) FROM sales s JOIN products p ON s.product_id = p.id GROUP BY p.name ORDER BY SUM(s.total) DESC
";

const POSTGRES_FALLBACK_TEMPLATE: &str = "DATABASE SCHEMA (PostgreSQL: {schema}):

Table: products
- id (bigint, primary key)
- name (text) - product name like 'Laptop', 'Smartphone'
- category (text) - category like 'Electronics', 'Furniture', 'Books'
- price (double precision) - price in dollars

Table: sales
- id (bigint, primary key)
- product_id (bigint) - references products.id
- quantity (integer) - number of items sold
- total (double precision) - total sale amount in dollars
- sale_date (date) - when the sale happened
- region (text) - 'North', 'South', 'East', or 'West'

RELATIONSHIPS:
- sales.product_id links to products.id
- To get product names with sales, JOIN the tables

EXAMPLE QUERIES:
- Total sales: SELECT SUM(total) FROM sales
- Sales by region: SELECT region, SUM(total) FROM sales GROUP BY region
- Top products: SELECT p.name, SUM(s.total) FROM sales s JOIN products p ON s.product_id = p.id GROUP BY p.name ORDER BY SUM(s.total) DESC

NOTE: Tables are in schema {schema}
";

#[derive(Debug, Error)]
pub enum SchemaDiscoveryError {
    #[error("metadata query failed: {0}")]
    Query(#[from] AppError),

    #[error("no tables discovered")]
    Empty,
}

/// Which catalog to query, chosen once from the configured backend
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryDialect {
    Sqlite,
    Postgres {
        schema: String,
        /// Restrict discovery to these tables; empty means every table in `schema`
        tables: Vec<String>,
    },
}

/// One successful discovery. Replaced wholesale on refresh.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    pub schema_text: String,
    pub table_names: Vec<String>,
    #[serde(skip)]
    pub cached_at: Instant,
    pub discovered_at: DateTime<Utc>,
    #[serde(skip)]
    pub ttl: Duration,
}

impl SchemaSnapshot {
    pub fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaSource {
    Cached,
    Discovered,
    Fallback,
}

/// A schema description plus where it came from
#[derive(Debug, Clone, Serialize)]
pub struct SchemaView {
    pub schema_text: String,
    pub table_names: Vec<String>,
    pub source: SchemaSource,
}

impl SchemaView {
    fn from_snapshot(snapshot: &SchemaSnapshot, source: SchemaSource) -> Self {
        Self {
            schema_text: snapshot.schema_text.clone(),
            table_names: snapshot.table_names.clone(),
            source,
        }
    }
}

pub struct SchemaDiscoveryCache {
    dialect: DiscoveryDialect,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<SchemaSnapshot>>>,
}

impl SchemaDiscoveryCache {
    pub fn new(dialect: DiscoveryDialect, ttl: Duration) -> Self {
        Self {
            dialect,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// Schema text for prompt injection. Never fails.
    pub async fn get_schema(&self, executor: &dyn QueryExecutor, force_refresh: bool) -> String {
        self.describe(executor, force_refresh).await.schema_text
    }

    /// Serve the cached snapshot while valid, otherwise rediscover.
    ///
    /// A failed discovery returns the static fallback and leaves the cache
    /// untouched, so the next call tries again.
    pub async fn describe(&self, executor: &dyn QueryExecutor, force_refresh: bool) -> SchemaView {
        if !force_refresh {
            if let Some(snapshot) = self.valid_snapshot() {
                return SchemaView::from_snapshot(&snapshot, SchemaSource::Cached);
            }
        }

        // The lock is not held across discovery; concurrent refreshes are last-write-wins
        match self.discover(executor).await {
            Ok((schema_text, table_names)) => {
                let snapshot = Arc::new(SchemaSnapshot {
                    schema_text,
                    table_names,
                    cached_at: Instant::now(),
                    discovered_at: Utc::now(),
                    ttl: self.ttl,
                });
                *self.snapshot.write() = Some(Arc::clone(&snapshot));
                tracing::info!("Discovered schema with {} tables", snapshot.table_names.len());
                SchemaView::from_snapshot(&snapshot, SchemaSource::Discovered)
            }
            Err(e) => {
                tracing::warn!("Schema discovery failed: {}. Using fallback.", e);
                SchemaView {
                    schema_text: self.fallback_text(),
                    table_names: self.fallback_tables(),
                    source: SchemaSource::Fallback,
                }
            }
        }
    }

    pub fn invalidate(&self) {
        *self.snapshot.write() = None;
        tracing::debug!("Schema cache invalidated");
    }

    /// Last successful discovery, even if it has expired
    pub fn snapshot(&self) -> Option<Arc<SchemaSnapshot>> {
        self.snapshot.read().clone()
    }

    pub fn fallback_text(&self) -> String {
        match &self.dialect {
            DiscoveryDialect::Sqlite => SQLITE_FALLBACK.to_string(),
            DiscoveryDialect::Postgres { schema, .. } => POSTGRES_FALLBACK_TEMPLATE.replace("{schema}", schema),
        }
    }

    fn fallback_tables(&self) -> Vec<String> {
        match &self.dialect {
            DiscoveryDialect::Postgres { tables, .. } if !tables.is_empty() => tables.clone(),
            _ => FALLBACK_TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn valid_snapshot(&self) -> Option<Arc<SchemaSnapshot>> {
        self.snapshot
            .read()
            .as_ref()
            .filter(|snapshot| snapshot.is_valid())
            .cloned()
    }

    async fn discover(&self, executor: &dyn QueryExecutor) -> Result<(String, Vec<String>), SchemaDiscoveryError> {
        let (header, tables) = match &self.dialect {
            DiscoveryDialect::Sqlite => (
                "DATABASE SCHEMA (SQLite - Dynamic Discovery):".to_string(),
                discover_sqlite(executor).await?,
            ),
            DiscoveryDialect::Postgres { schema, tables } => (
                format!("DATABASE SCHEMA (PostgreSQL: {} - Dynamic Discovery):", schema),
                discover_postgres(executor, schema, tables).await?,
            ),
        };

        if tables.is_empty() {
            return Err(SchemaDiscoveryError::Empty);
        }

        let names = tables.iter().map(|t| t.name.clone()).collect();
        Ok((render_schema(&header, &tables), names))
    }
}

async fn discover_sqlite(executor: &dyn QueryExecutor) -> Result<Vec<Table>, SchemaDiscoveryError> {
    let excluded = EXCLUDED_TABLES
        .iter()
        .map(|t| format!("'{}'", t))
        .collect::<Vec<_>>()
        .join(", ");
    let listing = executor
        .execute(&format!(
            "SELECT name FROM sqlite_master WHERE type='table' \
             AND name NOT LIKE 'sqlite_%' AND name NOT IN ({}) ORDER BY name",
            excluded
        ))
        .await?;

    let mut tables = Vec::new();
    for name in listing.rows.iter().filter_map(|row| text_field(row, "name")) {
        let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
        let columns = match executor.execute(&pragma).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!("Skipping table {}: {}", name, e);
                continue;
            }
        };

        let mut table = Table::new(name);
        table.columns = columns
            .rows
            .iter()
            .filter_map(|row| {
                Some(Column {
                    name: text_field(row, "name")?.to_string(),
                    data_type: text_field(row, "type").unwrap_or_default().to_string(),
                    is_nullable: row.get("notnull").and_then(Value::as_i64) == Some(0),
                    is_primary_key: row.get("pk").and_then(Value::as_i64).unwrap_or(0) > 0,
                })
            })
            .collect();
        tables.push(table);
    }
    Ok(tables)
}

async fn discover_postgres(
    executor: &dyn QueryExecutor,
    schema: &str,
    only: &[String],
) -> Result<Vec<Table>, SchemaDiscoveryError> {
    let mut sql = format!(
        "SELECT table_name::text AS table_name, column_name::text AS column_name, \
         data_type::text AS data_type, is_nullable::text AS is_nullable \
         FROM information_schema.columns WHERE table_schema = {}",
        quote_literal(schema)
    );
    if !only.is_empty() {
        let names = only.iter().map(|t| quote_literal(t)).collect::<Vec<_>>().join(", ");
        sql.push_str(&format!(" AND table_name IN ({})", names));
    }
    sql.push_str(" ORDER BY table_name, ordinal_position");

    let result = executor.execute(&sql).await?;
    let mut tables = group_columns(&result);

    // Configured order wins over catalog order
    if !only.is_empty() {
        tables.sort_by_key(|t| only.iter().position(|name| name == &t.name).unwrap_or(usize::MAX));
    }
    Ok(tables)
}

fn group_columns(result: &QueryResult) -> Vec<Table> {
    let mut tables: Vec<Table> = Vec::new();
    for row in &result.rows {
        let (Some(table_name), Some(column_name)) = (text_field(row, "table_name"), text_field(row, "column_name")) else {
            continue;
        };
        let column = Column {
            name: column_name.to_string(),
            data_type: text_field(row, "data_type").unwrap_or_default().to_string(),
            is_nullable: text_field(row, "is_nullable") == Some("YES"),
            is_primary_key: false,
        };
        match tables.iter_mut().find(|t| t.name == table_name) {
            Some(table) => table.columns.push(column),
            None => {
                let mut table = Table::new(table_name);
                table.columns.push(column);
                tables.push(table);
            }
        }
    }
    tables
}

fn render_schema(header: &str, tables: &[Table]) -> String {
    let mut parts = vec![header.to_string()];

    for table in tables {
        parts.push(String::new());
        parts.push(format!("Table: {}", table.name));
        for column in &table.columns {
            let mut annotations = vec![column.data_type.clone()];
            if column.is_primary_key {
                annotations.push("primary key".to_string());
            } else if column.is_nullable {
                annotations.push("nullable".to_string());
            }
            parts.push(format!("- {} ({})", column.name, annotations.join(", ")));
        }
    }

    parts.push(String::new());
    parts.push("RELATIONSHIPS:".to_string());
    parts.extend(RELATIONSHIP_HINTS.iter().map(|s| s.to_string()));

    parts.push(String::new());
    parts.push("EXAMPLE QUERIES:".to_string());
    parts.extend(EXAMPLE_QUERIES.iter().map(|s| s.to_string()));

    parts.join("\n")
}

fn text_field<'a>(row: &'a Value, field: &str) -> Option<&'a str> {
    row.get(field)?.as_str()
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
