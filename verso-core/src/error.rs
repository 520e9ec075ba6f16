//! Error types for VERSO operations

use std::time::Duration;
use thiserror::Error;

/// Cache store errors.
///
/// Every driver, I/O, or encoding failure inside a store collapses into
/// `Unreachable`. Callers never see raw driver errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unreachable: {store}: {reason}")]
    Unreachable { store: String, reason: String },
}

impl CacheError {
    /// Build an `Unreachable` error from any displayable cause.
    pub fn unreachable(store: impl Into<String>, reason: impl ToString) -> Self {
        CacheError::Unreachable {
            store: store.into(),
            reason: reason.to_string(),
        }
    }
}

/// Configuration errors, raised when an operation is registered or a config
/// is validated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Reserved name used as a parameter: {name}")]
    ReservedName { name: String },

    #[error("Unknown operation: {operation}")]
    UnknownOperation { operation: String },
}

/// Key template errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Positional placeholder {{{index}}} out of range in '{template}' ({available} supplied)")]
    UnknownPosition {
        template: String,
        index: usize,
        available: usize,
    },

    #[error("Placeholder :{placeholder} in '{template}' could not be resolved")]
    Unresolved { template: String, placeholder: String },

    #[error("Parameter name '{name}' is reserved")]
    ReservedName { name: String },

    #[error("Batch parameter {param} mismatch: {reason}")]
    BatchMismatch { param: String, reason: String },
}

/// Request coalescing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoalesceError {
    #[error("Coalesced call {key} incomplete: {reason}")]
    Incomplete { key: String, reason: String },
}

impl CoalesceError {
    /// A waiter that gave up after `timeout`.
    pub fn timed_out(key: impl Into<String>, timeout: Duration) -> Self {
        CoalesceError::Incomplete {
            key: key.into(),
            reason: format!("no result delivered within {:?}", timeout),
        }
    }

    /// A waiter whose leader went away without broadcasting.
    pub fn abandoned(key: impl Into<String>) -> Self {
        CoalesceError::Incomplete {
            key: key.into(),
            reason: "executing call finished without delivering a result".to_string(),
        }
    }
}

/// Backend executor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Backend call {operation} failed: {reason}")]
pub struct BackendError {
    pub operation: String,
    pub reason: String,
}

impl BackendError {
    pub fn new(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Master error type for all VERSO errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersoError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Coalesce error: {0}")]
    Coalesce(#[from] CoalesceError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Result type alias for VERSO operations.
pub type VersoResult<T> = Result<T, VersoError>;

// =============================================================================
// TESTS
// =============================================================================
