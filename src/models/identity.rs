use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller identity used to partition rate limits and cached responses.
///
/// Unauthenticated callers all map to [`Identity::Anonymous`] and therefore
/// share a single rate-limit budget and cache partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    #[default]
    Anonymous,
    User(String),
}

impl Identity {
    pub fn user(id: impl Into<String>) -> Self {
        Identity::User(id.into())
    }

    /// Parse an identity from a raw header value; blank values are anonymous.
    pub fn from_header_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(id) if !id.is_empty() => Identity::User(id.to_string()),
            _ => Identity::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }

    /// User id used inside cache key material; `None` for anonymous callers
    /// so no user id can share their partition.
    pub fn key(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::User(id) => Some(id),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => write!(f, "anonymous"),
            Identity::User(id) => write!(f, "user:{}", id),
        }
    }
}

impl From<i64> for Identity {
    fn from(id: i64) -> Self {
        Identity::User(id.to_string())
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Identity::User(id.to_string())
    }
}

impl<T: Into<Identity>> From<Option<T>> for Identity {
    fn from(id: Option<T>) -> Self {
        id.map(Into::into).unwrap_or_default()
    }
}
