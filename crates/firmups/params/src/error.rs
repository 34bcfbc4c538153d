//! Parameter validation errors

use firmups_types::{DeviceTypeId, ParameterType, ValidationError};
use thiserror::Error;

/// Parameter validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("Unknown parameter '{key}' for {device_type}")]
    UnknownParameter {
        device_type: DeviceTypeId,
        key: String,
    },

    #[error("Type mismatch for '{key}': expected {expected}, {reason}")]
    TypeMismatch {
        key: String,
        expected: ParameterType,
        reason: String,
    },

    #[error("Parameter '{key}' has no value and no default")]
    MissingValue { key: String },

    #[error("Parameter '{key}' already declared for {device_type}")]
    DuplicateKey {
        device_type: DeviceTypeId,
        key: String,
    },

    #[error("Invalid parameter: {0}")]
    Invalid(#[from] ValidationError),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, ParameterError>;
