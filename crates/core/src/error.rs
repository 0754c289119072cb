//! Core error types

use thiserror::Error;

/// Core error type for Lifeline
#[derive(Debug, Error)]
pub enum CoreError {
    /// Generic error
    #[error("Core error: {0}")]
    Generic(String),

    /// A configuration value is out of range or inconsistent
    #[error("Invalid configuration field `{field}`: {reason}")]
    InvalidConfig {
        /// Dotted path of the offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidConfig {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Alias kept for call sites that read better with a crate-qualified name
pub type Error = CoreError;
