//! Guard error types
//!
//! Denials are not errors: they travel as [`Decision`](crate::evaluator::Decision)
//! values. `GuardError` is reserved for faults the caller has to surface.

use thiserror::Error;

/// Stable, machine-readable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    DuplicateRule,
    InvalidScopeResourceShape,
    StoreUnavailable,
    LockNotHeld,
    RuleNotFound,
    VersionConflict,
    Forbidden,
    InvalidConfig,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DuplicateRule => "DUPLICATE_RULE",
            ErrorCode::InvalidScopeResourceShape => "INVALID_SCOPE_RESOURCE_SHAPE",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::LockNotHeld => "LOCK_NOT_HELD",
            ErrorCode::RuleNotFound => "RULE_NOT_FOUND",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the permission engine
#[derive(Error, Debug)]
pub enum GuardError {
    /// Another enabled rule already holds the same (actor, base, resource) key
    #[error("Duplicate rule: enabled rule {existing} already covers this actor and resource")]
    DuplicateRule { existing: String },

    /// Access level and resource disagree on scope, or an identifier is empty
    #[error("Invalid scope/resource shape: {0}")]
    InvalidScopeResourceShape(String),

    /// The rule store did not answer in time or failed underneath
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Release attempted by someone other than the current holder
    #[error("Lock not held: resource is locked by {holder}")]
    LockNotHeld { holder: String },

    /// No rule with this id
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    /// Compare-and-swap lost against a concurrent writer
    #[error("Version conflict on rule {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Caller lacks the privilege for an administrative operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GuardError {
    /// Create a shape error from a string
    pub fn shape(msg: impl Into<String>) -> Self {
        GuardError::InvalidScopeResourceShape(msg.into())
    }

    /// Create a store-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        GuardError::StoreUnavailable(msg.into())
    }

    /// Taxonomy code for this error. Storage-layer IO and encoding failures
    /// are reported as an unavailable store.
    pub fn code(&self) -> ErrorCode {
        match self {
            GuardError::DuplicateRule { .. } => ErrorCode::DuplicateRule,
            GuardError::InvalidScopeResourceShape(_) => ErrorCode::InvalidScopeResourceShape,
            GuardError::StoreUnavailable(_) | GuardError::Io(_) | GuardError::Serialization(_) => {
                ErrorCode::StoreUnavailable
            }
            GuardError::LockNotHeld { .. } => ErrorCode::LockNotHeld,
            GuardError::RuleNotFound(_) => ErrorCode::RuleNotFound,
            GuardError::VersionConflict { .. } => ErrorCode::VersionConflict,
            GuardError::Forbidden(_) => ErrorCode::Forbidden,
            GuardError::InvalidConfig(_) => ErrorCode::InvalidConfig,
        }
    }
}

/// Result type alias for guard operations
pub type GuardResult<T> = Result<T, GuardError>;
