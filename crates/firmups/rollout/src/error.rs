//! Rollout error types

use firmups_registry::RegistryError;
use firmups_types::{DeviceId, FirmwareId, StorageError};
use thiserror::Error;

/// Rollout errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RolloutError {
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Firmware not found: {0}")]
    FirmwareNotFound(FirmwareId),

    #[error("Install of {firmware} on {device} timed out (attempt {attempts})")]
    DispatchTimeout {
        device: DeviceId,
        firmware: FirmwareId,
        attempts: u32,
    },

    #[error("Device {device} rejected {firmware}: {reason} (attempt {attempts})")]
    Rejected {
        device: DeviceId,
        firmware: FirmwareId,
        reason: String,
        attempts: u32,
    },

    #[error("Install of {firmware} on {device} confirmed after the device was edited to a different plan")]
    Superseded {
        device: DeviceId,
        firmware: FirmwareId,
    },

    #[error("Device {device} still stale after {attempts} attempts")]
    StaleState { device: DeviceId, attempts: u32 },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RolloutError {
    /// Transient failure; the device is retried on a later pass
    pub fn is_retryable(&self) -> bool {
        match self {
            RolloutError::DispatchTimeout { .. }
            | RolloutError::Rejected { .. }
            | RolloutError::Superseded { .. }
            | RolloutError::StaleState { .. } => true,
            RolloutError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for rollout operations
pub type Result<T> = std::result::Result<T, RolloutError>;
