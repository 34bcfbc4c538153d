//! Device rows and explicit parameter values

use crate::{validate_name, DeviceId, DeviceTypeId, FirmwareId, ParameterType, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operational status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Active => write!(f, "ACTIVE"),
            DeviceStatus::Inactive => write!(f, "INACTIVE"),
            DeviceStatus::Maintenance => write!(f, "MAINTENANCE"),
        }
    }
}

/// A provisioned device
///
/// `current_firmware` is `None` until a first install is confirmed.
/// `desired_firmware` always names a target. Both must be registered as
/// compatible with `device_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub device_type: DeviceTypeId,
    pub current_firmware: Option<FirmwareId>,
    pub desired_firmware: FirmwareId,
    pub status: DeviceStatus,

    /// Row revision, bumped by every committed write
    #[serde(default)]
    pub revision: u64,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        device_type: DeviceTypeId,
        desired_firmware: FirmwareId,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name("device name", &name)?;
        Ok(Self {
            id: DeviceId::generate(),
            name,
            device_type,
            current_firmware: None,
            desired_firmware,
            status: DeviceStatus::Active,
            revision: 0,
        })
    }

    pub fn with_current_firmware(mut self, firmware: FirmwareId) -> Self {
        self.current_firmware = Some(firmware);
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the installed firmware already matches the target
    pub fn is_converged(&self) -> bool {
        self.current_firmware == Some(self.desired_firmware)
    }

    /// Firmware ids this row references
    pub fn referenced_firmware(&self) -> Vec<FirmwareId> {
        let mut ids = vec![self.desired_firmware];
        if let Some(current) = self.current_firmware {
            if current != self.desired_firmware {
                ids.push(current);
            }
        }
        ids
    }
}

/// Explicit parameter value stored for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParameter {
    pub device: DeviceId,
    pub key: String,
    pub value_type: ParameterType,
    /// Encoded value; `None` falls back to the schema default
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}
