//! Storage trait definitions
//!
//! Mirrors the relational layout: device types with their parameter
//! schemas, firmware, compatibility edges, devices, explicit parameter
//! values, and key rings. Referential rules follow the foreign keys:
//!
//! | Relation | On delete |
//! |---|---|
//! | device type <- parameter schema, device | RESTRICT |
//! | device type <- compatibility edge | CASCADE |
//! | firmware <- compatibility edge, device | RESTRICT |
//! | compatibility edge <- device (current or desired) | RESTRICT |
//! | parameter schema <- device parameter | RESTRICT |
//! | device <- device parameter, device key | CASCADE |

use async_trait::async_trait;
use firmups_keys::KeyStore;
use firmups_rollout::DeviceStore;
use firmups_types::{
    Device, DeviceId, DeviceKey, DeviceParameter, DeviceStatus, DeviceType, DeviceTypeId,
    Firmware, FirmwareId, ParameterSchema, StorageResult,
};

/// Combined storage trait
#[async_trait]
pub trait Storage:
    DeviceTypeStorage + FirmwareStorage + DeviceStorage + ParameterStorage + KeyStore + Send + Sync
{
}

/// Storage for device types and their parameter schemas
#[async_trait]
pub trait DeviceTypeStorage: Send + Sync {
    /// Create a device type; names are unique
    async fn create_device_type(&self, device_type: DeviceType) -> StorageResult<()>;

    async fn get_device_type(&self, id: &DeviceTypeId) -> StorageResult<Option<DeviceType>>;

    async fn find_device_type(&self, name: &str) -> StorageResult<Option<DeviceType>>;

    async fn list_device_types(&self) -> StorageResult<Vec<DeviceType>>;

    /// Delete a device type and its compatibility edges
    ///
    /// Restricted while schemas or devices of the type exist.
    async fn delete_device_type(&self, id: &DeviceTypeId) -> StorageResult<bool>;

    /// Declare a parameter on a device type
    async fn declare_parameter(&self, schema: ParameterSchema) -> StorageResult<()>;

    /// Remove a declaration; restricted while any device stores a value for it
    async fn remove_parameter_schema(&self, device_type: &DeviceTypeId, key: &str)
        -> StorageResult<bool>;
}

/// Storage for firmware images and compatibility edges
#[async_trait]
pub trait FirmwareStorage: Send + Sync {
    /// Create a firmware record; (name, version) pairs are unique
    async fn create_firmware(&self, firmware: Firmware) -> StorageResult<()>;

    async fn get_firmware(&self, id: &FirmwareId) -> StorageResult<Option<Firmware>>;

    async fn find_firmware(&self, name: &str, version: &str) -> StorageResult<Option<Firmware>>;

    async fn list_firmware(&self) -> StorageResult<Vec<Firmware>>;

    /// Delete firmware; restricted while any edge or device references it
    async fn delete_firmware(&self, id: &FirmwareId) -> StorageResult<bool>;

    async fn register_compatibility(
        &self,
        device_type: &DeviceTypeId,
        firmware: &FirmwareId,
    ) -> StorageResult<()>;

    /// Remove an edge; restricted while a device of the type references the firmware
    async fn unregister_compatibility(
        &self,
        device_type: &DeviceTypeId,
        firmware: &FirmwareId,
    ) -> StorageResult<()>;
}

/// Storage for device rows
#[async_trait]
pub trait DeviceStorage: DeviceStore {
    /// Create a device; its firmware must be compatible with its type
    async fn create_device(&self, device: Device) -> StorageResult<Device>;

    /// Point a device at a new target firmware
    async fn set_desired_firmware(
        &self,
        id: &DeviceId,
        firmware: &FirmwareId,
    ) -> StorageResult<Device>;

    async fn set_status(&self, id: &DeviceId, status: DeviceStatus) -> StorageResult<Device>;

    /// Delete a device together with its parameters and keys
    async fn delete_device(&self, id: &DeviceId) -> StorageResult<bool>;

    /// Every key row of a device, history included
    async fn keys_for_device(&self, id: &DeviceId) -> StorageResult<Vec<DeviceKey>>;
}

/// Storage for explicit device parameter values
#[async_trait]
pub trait ParameterStorage: Send + Sync {
    /// Insert or replace a value after validating it against the schema
    async fn set_parameter(&self, parameter: DeviceParameter) -> StorageResult<()>;

    async fn get_parameters(&self, device: &DeviceId) -> StorageResult<Vec<DeviceParameter>>;

    async fn delete_parameter(&self, device: &DeviceId, key: &str) -> StorageResult<bool>;
}
