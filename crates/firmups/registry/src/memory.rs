//! In-memory compatibility registry
//!
//! Edges and pins live behind one lock so that `unregister` and `pin_device`
//! can never interleave into an orphaned pin. Firmware metadata is immutable
//! and kept in a separate concurrent map.

use crate::compatibility::CompatibilityRegistry;
use crate::error::{RegistryError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use firmups_types::{DeviceId, DeviceTypeFirmware, DeviceTypeId, Firmware, FirmwareId};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct DevicePin {
    device_type: DeviceTypeId,
    firmware: Vec<FirmwareId>,
}

#[derive(Debug, Default)]
struct CompatibilityState {
    by_type: HashMap<DeviceTypeId, BTreeSet<FirmwareId>>,
    pins: HashMap<DeviceId, DevicePin>,
}

impl CompatibilityState {
    fn contains(&self, device_type: &DeviceTypeId, firmware: &FirmwareId) -> bool {
        self.by_type
            .get(device_type)
            .is_some_and(|set| set.contains(firmware))
    }

    fn pinned_by(&self, edge: &DeviceTypeFirmware) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .pins
            .iter()
            .filter(|(_, pin)| {
                pin.device_type == edge.device_type && pin.firmware.contains(&edge.firmware)
            })
            .map(|(id, _)| *id)
            .collect();
        devices.sort();
        devices
    }
}

/// In-memory compatibility registry
pub struct InMemoryCompatibilityRegistry {
    state: RwLock<CompatibilityState>,
    catalog: DashMap<FirmwareId, Firmware>,
}

impl InMemoryCompatibilityRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CompatibilityState::default()),
            catalog: DashMap::new(),
        }
    }

    /// Number of registered edges
    pub async fn edge_count(&self) -> usize {
        let state = self.state.read().await;
        state.by_type.values().map(|set| set.len()).sum()
    }
}

impl Default for InMemoryCompatibilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompatibilityRegistry for InMemoryCompatibilityRegistry {
    async fn is_compatible(
        &self,
        device_type: &DeviceTypeId,
        firmware: &FirmwareId,
    ) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.contains(device_type, firmware))
    }

    async fn compatible_firmware_for(&self, device_type: &DeviceTypeId) -> Result<Vec<Firmware>> {
        let ids: Vec<FirmwareId> = {
            let state = self.state.read().await;
            state
                .by_type
                .get(device_type)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };

        let mut firmware: Vec<Firmware> = ids
            .iter()
            .filter_map(|id| self.catalog.get(id).map(|f| f.clone()))
            .collect();
        firmware.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(firmware)
    }

    async fn firmware(&self, id: &FirmwareId) -> Result<Option<Firmware>> {
        Ok(self.catalog.get(id).map(|f| f.clone()))
    }

    async fn device_types_for(&self, firmware: &FirmwareId) -> Result<Vec<DeviceTypeId>> {
        let state = self.state.read().await;
        let mut types: Vec<DeviceTypeId> = state
            .by_type
            .iter()
            .filter(|(_, set)| set.contains(firmware))
            .map(|(id, _)| *id)
            .collect();
        types.sort();
        Ok(types)
    }

    async fn register(
        &self,
        device_type: &DeviceTypeId,
        firmware: &Firmware,
    ) -> Result<DeviceTypeFirmware> {
        let edge = DeviceTypeFirmware::new(*device_type, firmware.id);
        let mut state = self.state.write().await;

        if !state.by_type.entry(*device_type).or_default().insert(firmware.id) {
            return Err(RegistryError::AlreadyRegistered(edge));
        }
        self.catalog.insert(firmware.id, firmware.clone());

        info!(
            device_type = %device_type,
            firmware = %firmware.label(),
            "Registered firmware compatibility"
        );
        Ok(edge)
    }

    async fn unregister(&self, device_type: &DeviceTypeId, firmware: &FirmwareId) -> Result<()> {
        let edge = DeviceTypeFirmware::new(*device_type, *firmware);
        let mut state = self.state.write().await;

        if !state.contains(device_type, firmware) {
            return Err(RegistryError::NotRegistered(edge));
        }

        let devices = state.pinned_by(&edge);
        if !devices.is_empty() {
            return Err(RegistryError::WouldOrphan { edge, devices });
        }

        let now_empty = match state.by_type.get_mut(device_type) {
            Some(set) => {
                set.remove(firmware);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.by_type.remove(device_type);
        }

        info!(edge = %edge, "Unregistered firmware compatibility");
        Ok(())
    }

    async fn pin_device(
        &self,
        device: &DeviceId,
        device_type: &DeviceTypeId,
        firmware: &[FirmwareId],
    ) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(missing) = firmware.iter().find(|f| !state.contains(device_type, f)) {
            return Err(RegistryError::Incompatible {
                device: *device,
                edge: DeviceTypeFirmware::new(*device_type, *missing),
            });
        }

        let mut pinned = firmware.to_vec();
        pinned.sort();
        pinned.dedup();
        debug!(device = %device, pins = pinned.len(), "Pinned device firmware");

        state.pins.insert(
            *device,
            DevicePin {
                device_type: *device_type,
                firmware: pinned,
            },
        );
        Ok(())
    }

    async fn unpin_device(&self, device: &DeviceId) -> Result<()> {
        let mut state = self.state.write().await;
        state.pins.remove(device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firmware(version: &str) -> Firmware {
        Firmware::from_image("sensor-fw", version, version.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_query() {
        let registry = InMemoryCompatibilityRegistry::new();
        let t1 = DeviceTypeId::generate();
        let t2 = DeviceTypeId::generate();
        let f1 = firmware("1.0");
        let f2 = firmware("1.1");

        registry.register(&t1, &f2).await.unwrap();
        registry.register(&t1, &f1).await.unwrap();

        assert!(registry.is_compatible(&t1, &f1.id).await.unwrap());
        assert!(!registry.is_compatible(&t2, &f1.id).await.unwrap());

        let listed = registry.compatible_firmware_for(&t1).await.unwrap();
        let versions: Vec<_> = listed.iter().map(|f| f.version.as_str()).collect();
        assert_eq!(versions, vec!["1.0", "1.1"]);
        assert!(registry.compatible_firmware_for(&t2).await.unwrap().is_empty());
        assert_eq!(registry.device_types_for(&f1.id).await.unwrap(), vec![t1]);
    }

    #[tokio::test]
    async fn test_duplicate_register_is_conflict() {
        let registry = InMemoryCompatibilityRegistry::new();
        let t1 = DeviceTypeId::generate();
        let f1 = firmware("1.0");

        registry.register(&t1, &f1).await.unwrap();
        let err = registry.register(&t1, &f1).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
        assert!(err.is_conflict());
        assert_eq!(registry.edge_count().await, 1);
    }

    #[tokio::test]
    async fn test_unregister_refuses_to_orphan_pinned_device() {
        let registry = InMemoryCompatibilityRegistry::new();
        let t1 = DeviceTypeId::generate();
        let f1 = firmware("1.0");
        let f2 = firmware("1.1");
        let device = DeviceId::generate();

        registry.register(&t1, &f1).await.unwrap();
        registry.register(&t1, &f2).await.unwrap();
        registry.pin_device(&device, &t1, &[f1.id, f2.id]).await.unwrap();

        let err = registry.unregister(&t1, &f2.id).await.unwrap_err();
        match err {
            RegistryError::WouldOrphan { devices, .. } => assert_eq!(devices, vec![device]),
            other => panic!("unexpected error: {other:?}"),
        }

        // Device moves off f2, edge can go
        registry.pin_device(&device, &t1, &[f1.id]).await.unwrap();
        registry.unregister(&t1, &f2.id).await.unwrap();
        assert!(!registry.is_compatible(&t1, &f2.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pin_rejects_unregistered_pair() {
        let registry = InMemoryCompatibilityRegistry::new();
        let t1 = DeviceTypeId::generate();
        let f1 = firmware("1.0");
        let f3 = firmware("3.0");
        let device = DeviceId::generate();

        registry.register(&t1, &f1).await.unwrap();
        registry.pin_device(&device, &t1, &[f1.id]).await.unwrap();

        let err = registry
            .pin_device(&device, &t1, &[f1.id, f3.id])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Incompatible { .. }));

        // The previous pin set is untouched
        assert!(matches!(
            registry.unregister(&t1, &f1.id).await,
            Err(RegistryError::WouldOrphan { .. })
        ));

        registry.unpin_device(&device).await.unwrap();
        registry.unregister(&t1, &f1.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_unknown_edge() {
        let registry = InMemoryCompatibilityRegistry::new();
        let err = registry
            .unregister(&DeviceTypeId::generate(), &FirmwareId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(_)));
    }
}
