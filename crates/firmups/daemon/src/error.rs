//! Daemon error types

use firmups_keys::KeyLifecycleError;
use firmups_params::ParameterError;
use firmups_registry::RegistryError;
use firmups_rollout::RolloutError;
use firmups_types::{StorageError, ValidationError};
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Key lifecycle error: {0}")]
    Keys(#[from] KeyLifecycleError),

    #[error("Rollout error: {0}")]
    Rollout(#[from] RolloutError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        DaemonError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Inventory(e.to_string())
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
