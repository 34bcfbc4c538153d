//! Shared error types

use thiserror::Error;

/// Errors raised when validating entity fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    #[error("{field} too long (max {max})")]
    TooLong { field: &'static str, max: usize },

    #[error("invalid sha256 checksum: {0}")]
    InvalidChecksum(String),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

/// Errors surfaced by the storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or compatibility violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Delete or update rejected because dependents still reference the row
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Conditional update lost against a concurrent writer
    #[error("Stale state for {entity}: expected revision {expected}, found {found}")]
    Stale {
        entity: String,
        expected: u64,
        found: u64,
    },

    /// Row failed field validation
    #[error("Invalid data: {0}")]
    Invalid(#[from] ValidationError),

    /// Row violates its device type's parameter schema
    #[error("Schema violation: {0}")]
    Schema(String),

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether a conditional-update retry may succeed
    pub fn is_stale(&self) -> bool {
        matches!(self, StorageError::Stale { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Stale { .. } | StorageError::Backend(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_is_retryable() {
        let err = StorageError::Stale {
            entity: "device".into(),
            expected: 3,
            found: 4,
        };
        assert!(err.is_stale());
        assert!(err.is_retryable());
        assert!(!StorageError::Conflict("x".into()).is_retryable());
    }
}
