//! Registry error types

use firmups_types::{DeviceId, DeviceTypeFirmware, FirmwareId};
use thiserror::Error;

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Compatibility already registered: {0}")]
    AlreadyRegistered(DeviceTypeFirmware),

    #[error("Compatibility not registered: {0}")]
    NotRegistered(DeviceTypeFirmware),

    #[error("Unregistering {edge} would orphan {} device(s)", .devices.len())]
    WouldOrphan {
        edge: DeviceTypeFirmware,
        devices: Vec<DeviceId>,
    },

    #[error("Device {device} cannot use {edge}: pair is not registered")]
    Incompatible {
        device: DeviceId,
        edge: DeviceTypeFirmware,
    },

    #[error("Firmware not found: {0}")]
    FirmwareNotFound(FirmwareId),
}

impl RegistryError {
    /// Compatibility or uniqueness violation
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RegistryError::AlreadyRegistered(_)
                | RegistryError::WouldOrphan { .. }
                | RegistryError::Incompatible { .. }
        )
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
