//! In-memory key store

use crate::ring::KeyRing;
use crate::store::KeyStore;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use firmups_types::{DeviceId, DeviceKey, KeyType, StorageError, StorageResult};

/// Key rings held in a concurrent map, one entry per (device, key type)
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    rings: DashMap<(DeviceId, KeyType), KeyRing>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every ring of a device, returning how many key rows went with them
    pub fn remove_device(&self, device: &DeviceId) -> usize {
        let mut removed = 0;
        for key_type in KeyType::ALL {
            if let Some((_, ring)) = self.rings.remove(&(*device, key_type)) {
                removed += ring.rows().len();
            }
        }
        removed
    }

    /// All key rows of a device across key types
    pub fn rows_for(&self, device: &DeviceId) -> Vec<DeviceKey> {
        KeyType::ALL
            .iter()
            .filter_map(|key_type| self.rings.get(&(*device, *key_type)))
            .flat_map(|ring| ring.rows())
            .collect()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn load_ring(&self, device: &DeviceId, key_type: KeyType) -> StorageResult<KeyRing> {
        Ok(self
            .rings
            .get(&(*device, key_type))
            .map(|ring| ring.clone())
            .unwrap_or_else(|| KeyRing::empty(*device, key_type)))
    }

    async fn compare_and_swap_ring(
        &self,
        expected_revision: u64,
        ring: KeyRing,
    ) -> StorageResult<()> {
        let entity = format!("{} {} keys", ring.device, ring.key_type);
        match self.rings.entry((ring.device, ring.key_type)) {
            Entry::Occupied(mut slot) => {
                let found = slot.get().revision;
                if found != expected_revision {
                    return Err(StorageError::Stale {
                        entity,
                        expected: expected_revision,
                        found,
                    });
                }
                slot.insert(ring);
            }
            Entry::Vacant(slot) => {
                if expected_revision != 0 {
                    return Err(StorageError::Stale {
                        entity,
                        expected: expected_revision,
                        found: 0,
                    });
                }
                slot.insert(ring);
            }
        }
        Ok(())
    }
}
