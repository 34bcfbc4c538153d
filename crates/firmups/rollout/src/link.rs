//! Device-communication collaborator

use async_trait::async_trait;
use firmups_types::{DeviceId, DeviceKey, Firmware};

/// Result of asking a device to install firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Device confirmed the image is installed
    Success,
    Timeout,
    Rejected(String),
}

/// Result of delivering key material to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Device confirmed the key is installed
    Ack,
    Timeout,
}

/// Transport to devices
///
/// Both calls may be slow or never answer; callers bound them with their
/// own timeout and treat anything but a confirmation as retryable.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn install_firmware(&self, device: &DeviceId, firmware: &Firmware) -> InstallOutcome;

    async fn deliver_key(&self, device: &DeviceId, key: &DeviceKey) -> DeliveryOutcome;
}
