//! In-memory storage implementation
//!
//! Tables are guarded by independent locks, always taken in the order
//! device types, firmware, devices, parameters. Compatibility edges live in
//! the registry; every device write re-pins the firmware the row references
//! so that an edge still in use cannot be unregistered.

use super::traits::*;
use async_trait::async_trait;
use firmups_keys::{InMemoryKeyStore, KeyRing, KeyStore};
use firmups_params::{ParameterError, ParameterSchemaValidator};
use firmups_registry::{CompatibilityRegistry, InMemoryCompatibilityRegistry, RegistryError};
use firmups_rollout::DeviceStore;
use firmups_types::{
    validate_name, Device, DeviceId, DeviceKey, DeviceParameter, DeviceStatus, DeviceType,
    DeviceTypeId, Firmware, FirmwareId, KeyType, ParameterSchema, StorageError, StorageResult,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory storage for development and testing
pub struct InMemoryStorage {
    device_types: Arc<RwLock<HashMap<DeviceTypeId, DeviceType>>>,
    firmware: Arc<RwLock<HashMap<FirmwareId, Firmware>>>,
    devices: Arc<RwLock<HashMap<DeviceId, Device>>>,
    parameters: Arc<RwLock<HashMap<DeviceId, BTreeMap<String, DeviceParameter>>>>,
    keys: InMemoryKeyStore,
    registry: Arc<InMemoryCompatibilityRegistry>,
    validator: Arc<ParameterSchemaValidator>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(InMemoryCompatibilityRegistry::new()),
            Arc::new(ParameterSchemaValidator::new()),
        )
    }

    /// Create storage over an existing registry and schema catalog
    pub fn with_parts(
        registry: Arc<InMemoryCompatibilityRegistry>,
        validator: Arc<ParameterSchemaValidator>,
    ) -> Self {
        Self {
            device_types: Arc::new(RwLock::new(HashMap::new())),
            firmware: Arc::new(RwLock::new(HashMap::new())),
            devices: Arc::new(RwLock::new(HashMap::new())),
            parameters: Arc::new(RwLock::new(HashMap::new())),
            keys: InMemoryKeyStore::new(),
            registry,
            validator,
        }
    }

    pub fn registry(&self) -> Arc<InMemoryCompatibilityRegistry> {
        self.registry.clone()
    }

    pub fn validator(&self) -> Arc<ParameterSchemaValidator> {
        self.validator.clone()
    }

    /// Apply `mutate` to a device row, re-pinning firmware and bumping the revision
    async fn update_device<F>(
        &self,
        id: &DeviceId,
        expected_revision: Option<u64>,
        mutate: F,
    ) -> StorageResult<Device>
    where
        F: FnOnce(&mut Device) + Send,
    {
        let firmware = self.firmware.read().await;
        let mut devices = self.devices.write().await;

        let current = devices
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if let Some(expected) = expected_revision {
            if current.revision != expected {
                return Err(StorageError::Stale {
                    entity: id.to_string(),
                    expected,
                    found: current.revision,
                });
            }
        }

        let mut updated = current.clone();
        mutate(&mut updated);

        let referenced = updated.referenced_firmware();
        if let Some(missing) = referenced.iter().find(|f| !firmware.contains_key(*f)) {
            return Err(StorageError::NotFound(missing.to_string()));
        }
        if referenced != current.referenced_firmware() {
            self.registry
                .pin_device(id, &updated.device_type, &referenced)
                .await
                .map_err(registry_error)?;
        }

        updated.revision = current.revision + 1;
        devices.insert(*id, updated.clone());
        Ok(updated)
    }
}

fn registry_error(e: RegistryError) -> StorageError {
    match e {
        RegistryError::WouldOrphan { .. } => StorageError::Integrity(e.to_string()),
        RegistryError::NotRegistered(_) | RegistryError::FirmwareNotFound(_) => {
            StorageError::NotFound(e.to_string())
        }
        RegistryError::AlreadyRegistered(_) | RegistryError::Incompatible { .. } => {
            StorageError::Conflict(e.to_string())
        }
    }
}

fn parameter_error(e: ParameterError) -> StorageError {
    match e {
        ParameterError::DuplicateKey { .. } => StorageError::Conflict(e.to_string()),
        ParameterError::Invalid(v) => StorageError::Invalid(v),
        other => StorageError::Schema(other.to_string()),
    }
}

#[async_trait]
impl DeviceTypeStorage for InMemoryStorage {
    async fn create_device_type(&self, device_type: DeviceType) -> StorageResult<()> {
        validate_name("device type name", &device_type.name)?;
        let mut types = self.device_types.write().await;
        if types.contains_key(&device_type.id)
            || types.values().any(|t| t.name == device_type.name)
        {
            return Err(StorageError::Conflict(format!(
                "device type '{}' already exists",
                device_type.name
            )));
        }
        types.insert(device_type.id, device_type);
        Ok(())
    }

    async fn get_device_type(&self, id: &DeviceTypeId) -> StorageResult<Option<DeviceType>> {
        let types = self.device_types.read().await;
        Ok(types.get(id).cloned())
    }

    async fn find_device_type(&self, name: &str) -> StorageResult<Option<DeviceType>> {
        let types = self.device_types.read().await;
        Ok(types.values().find(|t| t.name == name).cloned())
    }

    async fn list_device_types(&self) -> StorageResult<Vec<DeviceType>> {
        let types = self.device_types.read().await;
        let mut list: Vec<DeviceType> = types.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn delete_device_type(&self, id: &DeviceTypeId) -> StorageResult<bool> {
        let mut types = self.device_types.write().await;
        if !types.contains_key(id) {
            return Ok(false);
        }
        if self.validator.has_schemas(id) {
            return Err(StorageError::Integrity(format!(
                "{} still declares parameter schemas",
                id
            )));
        }

        let devices = self.devices.read().await;
        if devices.values().any(|d| d.device_type == *id) {
            return Err(StorageError::Integrity(format!("{} still has devices", id)));
        }

        // Cascade compatibility edges; no device can pin them at this point
        for firmware in self
            .registry
            .compatible_firmware_for(id)
            .await
            .map_err(registry_error)?
        {
            self.registry
                .unregister(id, &firmware.id)
                .await
                .map_err(registry_error)?;
        }

        types.remove(id);
        Ok(true)
    }

    async fn declare_parameter(&self, schema: ParameterSchema) -> StorageResult<()> {
        let types = self.device_types.read().await;
        if !types.contains_key(&schema.device_type) {
            return Err(StorageError::NotFound(schema.device_type.to_string()));
        }
        self.validator.register(schema).map_err(parameter_error)
    }

    async fn remove_parameter_schema(
        &self,
        device_type: &DeviceTypeId,
        key: &str,
    ) -> StorageResult<bool> {
        let _types = self.device_types.read().await;
        let devices = self.devices.read().await;
        let parameters = self.parameters.write().await;

        let in_use = devices
            .values()
            .filter(|d| d.device_type == *device_type)
            .any(|d| parameters.get(&d.id).is_some_and(|p| p.contains_key(key)));
        if in_use {
            return Err(StorageError::Integrity(format!(
                "parameter '{}' still has device values",
                key
            )));
        }

        Ok(self.validator.remove(device_type, key).is_some())
    }
}

#[async_trait]
impl FirmwareStorage for InMemoryStorage {
    async fn create_firmware(&self, firmware: Firmware) -> StorageResult<()> {
        firmware.validate()?;
        let mut catalog = self.firmware.write().await;
        if catalog.contains_key(&firmware.id)
            || catalog
                .values()
                .any(|f| f.name == firmware.name && f.version == firmware.version)
        {
            return Err(StorageError::Conflict(format!(
                "firmware {} already exists",
                firmware.label()
            )));
        }
        catalog.insert(firmware.id, firmware);
        Ok(())
    }

    async fn get_firmware(&self, id: &FirmwareId) -> StorageResult<Option<Firmware>> {
        let catalog = self.firmware.read().await;
        Ok(catalog.get(id).cloned())
    }

    async fn find_firmware(&self, name: &str, version: &str) -> StorageResult<Option<Firmware>> {
        let catalog = self.firmware.read().await;
        Ok(catalog
            .values()
            .find(|f| f.name == name && f.version == version)
            .cloned())
    }

    async fn list_firmware(&self) -> StorageResult<Vec<Firmware>> {
        let catalog = self.firmware.read().await;
        let mut list: Vec<Firmware> = catalog.values().cloned().collect();
        list.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(list)
    }

    async fn delete_firmware(&self, id: &FirmwareId) -> StorageResult<bool> {
        let mut catalog = self.firmware.write().await;
        if !catalog.contains_key(id) {
            return Ok(false);
        }

        let types = self
            .registry
            .device_types_for(id)
            .await
            .map_err(registry_error)?;
        if !types.is_empty() {
            return Err(StorageError::Integrity(format!(
                "{} is compatible with {} device type(s)",
                id,
                types.len()
            )));
        }

        let devices = self.devices.read().await;
        if devices.values().any(|d| d.referenced_firmware().contains(id)) {
            return Err(StorageError::Integrity(format!(
                "{} is referenced by devices",
                id
            )));
        }

        catalog.remove(id);
        Ok(true)
    }

    async fn register_compatibility(
        &self,
        device_type: &DeviceTypeId,
        firmware: &FirmwareId,
    ) -> StorageResult<()> {
        let types = self.device_types.read().await;
        if !types.contains_key(device_type) {
            return Err(StorageError::NotFound(device_type.to_string()));
        }
        let catalog = self.firmware.read().await;
        let image = catalog
            .get(firmware)
            .ok_or_else(|| StorageError::NotFound(firmware.to_string()))?;

        self.registry
            .register(device_type, image)
            .await
            .map(|_| ())
            .map_err(registry_error)
    }

    async fn unregister_compatibility(
        &self,
        device_type: &DeviceTypeId,
        firmware: &FirmwareId,
    ) -> StorageResult<()> {
        self.registry
            .unregister(device_type, firmware)
            .await
            .map_err(registry_error)
    }
}

#[async_trait]
impl DeviceStore for InMemoryStorage {
    async fn get_device(&self, id: &DeviceId) -> StorageResult<Option<Device>> {
        let devices = self.devices.read().await;
        Ok(devices.get(id).cloned())
    }

    async fn list_devices(&self) -> StorageResult<Vec<Device>> {
        let devices = self.devices.read().await;
        let mut list: Vec<Device> = devices.values().cloned().collect();
        list.sort_by(|a, b| (&a.name, a.id).cmp(&(&b.name, b.id)));
        Ok(list)
    }

    async fn compare_and_set_current_firmware(
        &self,
        id: &DeviceId,
        expected_revision: u64,
        firmware: FirmwareId,
    ) -> StorageResult<Device> {
        self.update_device(id, Some(expected_revision), |device| {
            device.current_firmware = Some(firmware)
        })
        .await
    }
}

#[async_trait]
impl DeviceStorage for InMemoryStorage {
    async fn create_device(&self, device: Device) -> StorageResult<Device> {
        validate_name("device name", &device.name)?;

        let types = self.device_types.read().await;
        if !types.contains_key(&device.device_type) {
            return Err(StorageError::NotFound(device.device_type.to_string()));
        }
        let catalog = self.firmware.read().await;
        let referenced = device.referenced_firmware();
        if let Some(missing) = referenced.iter().find(|f| !catalog.contains_key(*f)) {
            return Err(StorageError::NotFound(missing.to_string()));
        }

        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.id) {
            return Err(StorageError::Conflict(format!("{} already exists", device.id)));
        }

        self.registry
            .pin_device(&device.id, &device.device_type, &referenced)
            .await
            .map_err(registry_error)?;

        let device = Device {
            revision: 0,
            ..device
        };
        devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn set_desired_firmware(
        &self,
        id: &DeviceId,
        firmware: &FirmwareId,
    ) -> StorageResult<Device> {
        let firmware = *firmware;
        self.update_device(id, None, |device| device.desired_firmware = firmware)
            .await
    }

    async fn set_status(&self, id: &DeviceId, status: DeviceStatus) -> StorageResult<Device> {
        self.update_device(id, None, |device| device.status = status)
            .await
    }

    async fn delete_device(&self, id: &DeviceId) -> StorageResult<bool> {
        let mut devices = self.devices.write().await;
        if devices.remove(id).is_none() {
            return Ok(false);
        }

        let mut parameters = self.parameters.write().await;
        parameters.remove(id);
        self.keys.remove_device(id);
        self.registry
            .unpin_device(id)
            .await
            .map_err(registry_error)?;
        Ok(true)
    }

    async fn keys_for_device(&self, id: &DeviceId) -> StorageResult<Vec<DeviceKey>> {
        let devices = self.devices.read().await;
        if !devices.contains_key(id) {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(self.keys.rows_for(id))
    }
}

#[async_trait]
impl ParameterStorage for InMemoryStorage {
    async fn set_parameter(&self, parameter: DeviceParameter) -> StorageResult<()> {
        let devices = self.devices.read().await;
        let device = devices
            .get(&parameter.device)
            .ok_or_else(|| StorageError::NotFound(parameter.device.to_string()))?;

        let mut parameters = self.parameters.write().await;
        self.validator
            .validate_parameter(&device.device_type, &parameter)
            .map_err(parameter_error)?;

        parameters
            .entry(parameter.device)
            .or_default()
            .insert(parameter.key.clone(), parameter);
        Ok(())
    }

    async fn get_parameters(&self, device: &DeviceId) -> StorageResult<Vec<DeviceParameter>> {
        let parameters = self.parameters.read().await;
        Ok(parameters
            .get(device)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_parameter(&self, device: &DeviceId, key: &str) -> StorageResult<bool> {
        let mut parameters = self.parameters.write().await;
        Ok(parameters
            .get_mut(device)
            .is_some_and(|p| p.remove(key).is_some()))
    }
}

#[async_trait]
impl KeyStore for InMemoryStorage {
    async fn load_ring(&self, device: &DeviceId, key_type: KeyType) -> StorageResult<KeyRing> {
        let devices = self.devices.read().await;
        if !devices.contains_key(device) {
            return Err(StorageError::NotFound(device.to_string()));
        }
        self.keys.load_ring(device, key_type).await
    }

    async fn compare_and_swap_ring(
        &self,
        expected_revision: u64,
        ring: KeyRing,
    ) -> StorageResult<()> {
        // Held across the swap so a concurrent delete cannot strand the ring
        let devices = self.devices.read().await;
        if !devices.contains_key(&ring.device) {
            return Err(StorageError::NotFound(ring.device.to_string()));
        }
        self.keys.compare_and_swap_ring(expected_revision, ring).await
    }
}

impl Storage for InMemoryStorage {}
