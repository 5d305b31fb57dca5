use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::api::handlers::AppState;
use crate::models::Identity;
use crate::services::connection_pool::PoolError;
use crate::services::rate_limiter::{LimitType, RateLimitDecision, RateLimitRejection};

/// Header set by the authentication layer in front of this service
pub const USER_ID_HEADER: &str = "x-user-id";
pub const REMAINING_MINUTE_HEADER: &str = "x-ratelimit-remaining-minute";
pub const REMAINING_HOUR_HEADER: &str = "x-ratelimit-remaining-hour";

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after: Duration,
        limit_type: LimitType,
    },

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Seconds until a rate-limited request may be retried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_type: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retry_after: None,
            limit_type: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Whole seconds for the `Retry-After` header, rounded up and at least 1
fn retry_after_header(retry_after: Duration) -> HeaderValue {
    let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
    HeaderValue::from(secs)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_header = None;
        let (status, error_detail) = match self {
            AppError::Database(msg) => {
                let enhanced_msg = if msg.contains("no such table") || msg.contains("does not exist") {
                    format!("{} Try refreshing the schema or check if the table name is correct.", msg)
                } else {
                    msg
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetail::new("DATABASE_ERROR", enhanced_msg),
                )
            }
            AppError::Connection(msg) => (
                StatusCode::BAD_GATEWAY,
                ErrorDetail::new("CONNECTION_ERROR", msg),
            ),
            AppError::InvalidSql(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("INVALID_SQL", msg)
                    .with_details("Only SELECT queries are allowed. Please check your SQL syntax."),
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("VALIDATION_ERROR", msg),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorDetail::new("NOT_FOUND", msg),
            ),
            AppError::PoolExhausted(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorDetail::new("POOL_EXHAUSTED", msg)
                    .with_details("All database connections are busy. Retry with backoff."),
            ),
            AppError::PoolClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorDetail::new("POOL_CLOSED", "Connection pool is closed"),
            ),
            AppError::RateLimited {
                message,
                retry_after,
                limit_type,
            } => {
                retry_header = Some(retry_after_header(retry_after));
                let mut detail = ErrorDetail::new("RATE_LIMITED", message);
                detail.retry_after = Some(retry_after.as_secs_f64());
                detail.limit_type = Some(limit_type.as_str().to_string());
                (StatusCode::TOO_MANY_REQUESTS, detail)
            }
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("INTERNAL_ERROR", msg),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        let mut response = (status, body).into_response();
        if let Some(value) = retry_header {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<PoolError> for AppError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } => AppError::PoolExhausted(err.to_string()),
            PoolError::Closed => AppError::PoolClosed,
            PoolError::ValidationFailed(msg) | PoolError::Connection(msg) => AppError::Connection(msg),
        }
    }
}

impl From<RateLimitRejection> for AppError {
    fn from(rejection: RateLimitRejection) -> Self {
        AppError::RateLimited {
            message: rejection.message,
            retry_after: rejection.retry_after,
            limit_type: rejection.limit_type,
        }
    }
}

/// Caller identity from the `X-User-Id` header; absent means anonymous
pub fn identity_from_headers(headers: &HeaderMap) -> Identity {
    Identity::from_header_value(headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()))
}

/// Admission control for rate-limited routes.
///
/// Rejections become 429 responses; admitted responses carry the remaining
/// per-minute and per-hour budget.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    let identity = identity_from_headers(request.headers());

    match state.rate_limiter.check(&identity) {
        RateLimitDecision::Limited(rejection) => Err(rejection.into()),
        RateLimitDecision::Allowed(remaining) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(REMAINING_MINUTE_HEADER, HeaderValue::from(remaining.minute));
            headers.insert(REMAINING_HOUR_HEADER, HeaderValue::from(remaining.hour));
            Ok(response)
        }
    }
}
