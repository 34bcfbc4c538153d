//! Compatibility registry trait

use crate::error::Result;
use async_trait::async_trait;
use firmups_types::{DeviceId, DeviceTypeFirmware, DeviceTypeId, Firmware, FirmwareId};

/// Authoritative set of (device type, firmware) pairs eligible for installation
#[async_trait]
pub trait CompatibilityRegistry: Send + Sync {
    /// Whether devices of `device_type` may run `firmware`
    async fn is_compatible(&self, device_type: &DeviceTypeId, firmware: &FirmwareId)
        -> Result<bool>;

    /// All firmware registered for a device type, ordered by name then version
    async fn compatible_firmware_for(&self, device_type: &DeviceTypeId) -> Result<Vec<Firmware>>;

    /// Look up firmware metadata known to the registry
    async fn firmware(&self, id: &FirmwareId) -> Result<Option<Firmware>>;

    /// Device types that list a firmware as compatible
    async fn device_types_for(&self, firmware: &FirmwareId) -> Result<Vec<DeviceTypeId>>;

    /// Register a compatibility edge
    async fn register(
        &self,
        device_type: &DeviceTypeId,
        firmware: &Firmware,
    ) -> Result<DeviceTypeFirmware>;

    /// Remove a compatibility edge; fails while any device pins it
    async fn unregister(&self, device_type: &DeviceTypeId, firmware: &FirmwareId) -> Result<()>;

    /// Replace the set of pairs a device pins
    ///
    /// Fails without changing anything if any pair is not registered.
    async fn pin_device(
        &self,
        device: &DeviceId,
        device_type: &DeviceTypeId,
        firmware: &[FirmwareId],
    ) -> Result<()>;

    /// Drop every pin held by a device
    async fn unpin_device(&self, device: &DeviceId) -> Result<()>;
}
