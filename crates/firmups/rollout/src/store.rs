//! Device rows as seen by the rollout reconciler

use async_trait::async_trait;
use firmups_types::{Device, DeviceId, FirmwareId, StorageResult};

/// Storage seam for device reads and conditional firmware updates
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_device(&self, id: &DeviceId) -> StorageResult<Option<Device>>;

    async fn list_devices(&self) -> StorageResult<Vec<Device>>;

    /// Record `firmware` as installed if the row is still at `expected_revision`
    ///
    /// Returns the updated row, or `StorageError::Stale` without writing.
    async fn compare_and_set_current_firmware(
        &self,
        id: &DeviceId,
        expected_revision: u64,
        firmware: FirmwareId,
    ) -> StorageResult<Device>;
}
