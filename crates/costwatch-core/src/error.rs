//! Error types for CostWatch

use std::time::Duration;

use thiserror::Error;

/// Result type alias using CostWatch's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for CostWatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// State database error (watermarks, rules, notification state)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Analytics store error
    #[error("Analytics store error: {0}")]
    Analytics(#[from] clickhouse::error::Error),

    /// Outbound HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Usage provider failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Notification delivery failure
    #[error("Notification error: {0}")]
    Notification(String),

    /// A bounded call did not finish in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The surrounding tick was cancelled
    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Write attempted against a read-only store
    #[error("{0} is read-only")]
    ReadOnly(&'static str),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a notification error
    pub fn notification(msg: impl Into<String>) -> Self {
        Self::Notification(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying on a later tick can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Analytics(_)
                | Self::Http(_)
                | Self::Provider(_)
                | Self::Notification(_)
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
