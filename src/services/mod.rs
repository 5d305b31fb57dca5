pub mod connection_pool;
pub mod connector;
pub mod database; // SQLite and PostgreSQL backends behind capability traits
pub mod rate_limiter;
pub mod response_cache; // Response cache with TTL and oldest-first eviction
pub mod schema_cache;

pub use connection_pool::*;
pub use connector::*;
pub use database::{DatabaseType, QueryExecutor, QueryResult};
pub use rate_limiter::*;
pub use response_cache::*;
pub use schema_cache::*;
