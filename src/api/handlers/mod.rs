pub mod health;
pub mod query;
pub mod schema;
pub mod stats;

use std::sync::Arc;

use crate::models::Query;
use crate::services::{DatabaseConnector, RateLimiter, ResponseCache};

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub connector: Arc<DatabaseConnector>,
    pub response_cache: Arc<ResponseCache<Query>>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        connector: Arc<DatabaseConnector>,
        response_cache: Arc<ResponseCache<Query>>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            connector,
            response_cache,
            rate_limiter,
        }
    }
}
