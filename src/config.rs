use config::ConfigError;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::{ConnectorOptions, DatabaseType, PoolConfig, RateLimitConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitConfig,
    pub schema: SchemaSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite` or `postgresql`
    pub backend: String,
    pub url: String,
    /// Namespace used to qualify bare table names
    pub schema: Option<String>,
    /// Comma-separated list of the analytics tables
    pub tables: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub validation_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub default_ttl_secs: u64,
    pub max_entries: usize,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaSettings {
    pub cache_ttl_secs: u64,
}

/// Environment variables and the settings they override
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("RUST_LOG", "logging.level"),
    ("RUST_LOG_STYLE", "logging.style"),
    ("ANALYTICS_BACKEND", "database.backend"),
    ("DATABASE_URL", "database.url"),
    ("DATABASE_SCHEMA", "database.schema"),
    ("DATABASE_TABLES", "database.tables"),
    ("DB_POOL_MIN_SIZE", "pool.min_size"),
    ("DB_POOL_MAX_SIZE", "pool.max_size"),
    ("DB_POOL_ACQUIRE_TIMEOUT", "pool.acquire_timeout_secs"),
    ("DB_POOL_IDLE_TIMEOUT", "pool.idle_timeout_secs"),
    ("DB_POOL_VALIDATION_INTERVAL", "pool.validation_interval_secs"),
    ("CACHE_DEFAULT_TTL", "cache.default_ttl_secs"),
    ("CACHE_MAX_ENTRIES", "cache.max_entries"),
    ("CACHE_CLEANUP_INTERVAL", "cache.cleanup_interval_secs"),
    ("RATE_LIMIT_PER_MINUTE", "rate_limit.requests_per_minute"),
    ("RATE_LIMIT_PER_HOUR", "rate_limit.requests_per_hour"),
    ("RATE_LIMIT_BURST", "rate_limit.burst_limit"),
    ("SCHEMA_CACHE_TTL", "schema.cache_ttl_secs"),
];

impl Config {
    /// Load defaults, then `.env`, then process environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build the configuration with `lookup` standing in for the environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 5000)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?
            .set_default("database.backend", "sqlite")?
            .set_default("database.url", "sales.db")?
            .set_default("database.tables", "products,sales")?
            .set_default("pool.min_size", 2)?
            .set_default("pool.max_size", 10)?
            .set_default("pool.acquire_timeout_secs", 30)?
            .set_default("pool.idle_timeout_secs", 300)?
            .set_default("pool.validation_interval_secs", 60)?
            .set_default("cache.default_ttl_secs", 300)?
            .set_default("cache.max_entries", 1000)?
            .set_default("cache.cleanup_interval_secs", 60)?
            .set_default("rate_limit.requests_per_minute", 10)?
            .set_default("rate_limit.requests_per_hour", 100)?
            .set_default("rate_limit.burst_limit", 5)?
            .set_default("schema.cache_ttl_secs", 300)?;

        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                builder = builder.set_override(*key, value)?;
            }
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.database.url.trim().is_empty() {
            return fail("database.url must not be empty");
        }
        self.database_type()?;
        if self.pool.max_size == 0 {
            return fail("pool.max_size must be at least 1");
        }
        if self.pool.min_size > self.pool.max_size {
            return fail("pool.min_size must not exceed pool.max_size");
        }
        if self.cache.max_entries == 0 {
            return fail("cache.max_entries must be at least 1");
        }
        let durations = [
            ("pool.acquire_timeout_secs", self.pool.acquire_timeout_secs),
            ("pool.idle_timeout_secs", self.pool.idle_timeout_secs),
            ("cache.default_ttl_secs", self.cache.default_ttl_secs),
            ("cache.cleanup_interval_secs", self.cache.cleanup_interval_secs),
            ("schema.cache_ttl_secs", self.schema.cache_ttl_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Message(format!("{} must be positive", name)));
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn database_type(&self) -> Result<DatabaseType, ConfigError> {
        DatabaseType::from_str(&self.database.backend).map_err(|e| ConfigError::Message(e.to_string()))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_min_size(self.pool.min_size)
            .with_max_size(self.pool.max_size)
            .with_acquire_timeout(Duration::from_secs(self.pool.acquire_timeout_secs))
            .with_idle_timeout(Duration::from_secs(self.pool.idle_timeout_secs))
            .with_validation_interval(Duration::from_secs(self.pool.validation_interval_secs))
    }

    pub fn connector_options(&self) -> ConnectorOptions {
        ConnectorOptions {
            qualifier: self
                .database
                .schema
                .clone()
                .filter(|schema| !schema.trim().is_empty()),
            tables: self
                .database
                .tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            schema_cache_ttl: Duration::from_secs(self.schema.cache_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.database_type().unwrap(), DatabaseType::Sqlite);
        assert_eq!(config.rate_limit, RateLimitConfig::default());

        let pool = config.pool_config();
        assert_eq!(pool, PoolConfig::default());

        let options = config.connector_options();
        assert_eq!(options.qualifier, None);
        assert_eq!(options.tables, vec!["products", "sales"]);
    }

    #[test]
    fn test_environment_overrides() {
        let config = load(&[
            ("PORT", "8080"),
            ("ANALYTICS_BACKEND", "postgresql"),
            ("DATABASE_URL", "postgres://app@localhost/analytics"),
            ("DATABASE_SCHEMA", "analytics"),
            ("DATABASE_TABLES", "orders, customers"),
            ("DB_POOL_MAX_SIZE", "4"),
            ("DB_POOL_ACQUIRE_TIMEOUT", "5"),
            ("RATE_LIMIT_PER_MINUTE", "3"),
        ])
        .unwrap();

        assert_eq!(config.server_address(), "0.0.0.0:8080");
        assert_eq!(config.database_type().unwrap(), DatabaseType::PostgreSQL);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool_config().acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.rate_limit.requests_per_minute, 3);

        let options = config.connector_options();
        assert_eq!(options.qualifier.as_deref(), Some("analytics"));
        assert_eq!(options.tables, vec!["orders", "customers"]);
    }

    #[test]
    fn test_rejects_inconsistent_pool_sizes() {
        let err = load(&[("DB_POOL_MIN_SIZE", "5"), ("DB_POOL_MAX_SIZE", "2")]).unwrap_err();
        assert!(err.to_string().contains("pool.min_size"));

        assert!(load(&[("DB_POOL_MAX_SIZE", "0"), ("DB_POOL_MIN_SIZE", "0")]).is_err());
    }

    #[test]
    fn test_rejects_unknown_backend_and_zero_durations() {
        assert!(load(&[("ANALYTICS_BACKEND", "databricks")]).is_err());
        assert!(load(&[("SCHEMA_CACHE_TTL", "0")]).is_err());
        assert!(load(&[("CACHE_MAX_ENTRIES", "0")]).is_err());
    }

    #[test]
    fn test_rejects_non_numeric_values() {
        assert!(load(&[("PORT", "not-a-port")]).is_err());
    }
}
