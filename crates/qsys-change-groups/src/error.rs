//! Error types for change groups, auto-polling and the event cache

use qsys_core::{ControlNameError, GatewayError};
use serde::Serialize;
use thiserror::Error;

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    GroupNotFound,
    InvalidGroupId,
    InvalidControlName,
    InvalidInterval,
    Disconnected,
    GatewayFailure,
    QueryTimeout,
    InvalidQuery,
    Config,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::GroupNotFound => "GROUP_NOT_FOUND",
            ErrorCode::InvalidGroupId => "INVALID_GROUP_ID",
            ErrorCode::InvalidControlName => "INVALID_CONTROL_NAME",
            ErrorCode::InvalidInterval => "INVALID_INTERVAL",
            ErrorCode::Disconnected => "DISCONNECTED",
            ErrorCode::GatewayFailure => "GATEWAY_FAILURE",
            ErrorCode::QueryTimeout => "QUERY_TIMEOUT",
            ErrorCode::InvalidQuery => "INVALID_QUERY",
            ErrorCode::Config => "CONFIG",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for change group operations
#[derive(Debug, Error)]
pub enum ChangeGroupError {
    #[error("Change group not found: {0}")]
    GroupNotFound(String),

    #[error("Invalid group id {id:?}: {reason}")]
    InvalidGroupId { id: String, reason: String },

    #[error("Invalid control name: {0}")]
    InvalidControlName(#[from] ControlNameError),

    #[error("Poll interval {interval_secs}s out of range ({min_secs}s to {max_secs}s)")]
    IntervalOutOfRange {
        interval_secs: f64,
        min_secs: f64,
        max_secs: f64,
    },

    #[error("Not connected to the core")]
    Disconnected,

    #[error("Gateway error: {0}")]
    Gateway(GatewayError),

    #[error("Event cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<GatewayError> for ChangeGroupError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Disconnected => ChangeGroupError::Disconnected,
            other => ChangeGroupError::Gateway(other),
        }
    }
}

impl ChangeGroupError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChangeGroupError::GroupNotFound(_) => ErrorCode::GroupNotFound,
            ChangeGroupError::InvalidGroupId { .. } => ErrorCode::InvalidGroupId,
            ChangeGroupError::InvalidControlName(_) => ErrorCode::InvalidControlName,
            ChangeGroupError::IntervalOutOfRange { .. } => ErrorCode::InvalidInterval,
            ChangeGroupError::Disconnected => ErrorCode::Disconnected,
            ChangeGroupError::Gateway(_) => ErrorCode::GatewayFailure,
            ChangeGroupError::Cache(e) => e.code(),
            ChangeGroupError::Config(_) => ErrorCode::Config,
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        ChangeGroupError::GroupNotFound(id.into())
    }

    pub fn invalid_group_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        ChangeGroupError::InvalidGroupId {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Event cache errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error(
        "Query timed out after {elapsed_ms}ms (budget {budget_ms}ms); narrow the time window, \
         filter by group or control, or lower the limit"
    )]
    QueryTimeout { elapsed_ms: u64, budget_ms: u64 },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl CacheError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CacheError::QueryTimeout { .. } => ErrorCode::QueryTimeout,
            CacheError::InvalidQuery(_) => ErrorCode::InvalidQuery,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type alias for change group operations
pub type ChangeGroupResult<T> = Result<T, ChangeGroupError>;
