//! Key lifecycle manager
//!
//! Applies ring transitions against a [`KeyStore`] with optimistic
//! concurrency: load, transition, compare-and-swap, and on a lost race
//! reload and re-decide, up to a bounded number of attempts.

use crate::error::{KeyLifecycleError, Result};
use crate::ring::{ExpiryOutcome, KeyRing};
use crate::store::KeyStore;
use chrono::{DateTime, Duration, Utc};
use firmups_types::{DeviceId, DeviceKey, DeviceKeyId, KeyMaterial, KeyStatus, KeyType};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Default number of compare-and-swap attempts per operation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Keys touched by a committed rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationCommit {
    /// Former NEXT, now ACTIVE
    pub activated: DeviceKey,
    /// Former ACTIVE, now EXPIRED; `None` when the ring had lapsed
    pub expired: Option<DeviceKey>,
}

/// Manages the ACTIVE / NEXT / EXPIRED lifecycle of device keys
pub struct KeyLifecycleManager {
    store: Arc<dyn KeyStore>,
    max_attempts: u32,
    renewal_window: Duration,
}

impl KeyLifecycleManager {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            renewal_window: Duration::zero(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// TLS keys this close to `valid_to` are reported as renewal due
    pub fn with_renewal_window(mut self, window: Duration) -> Self {
        self.renewal_window = window;
        self
    }

    /// Create the first ACTIVE key
    #[instrument(skip(self, material), fields(device = %device, key_type = %key_type))]
    pub async fn provision(
        &self,
        device: &DeviceId,
        key_type: KeyType,
        material: KeyMaterial,
    ) -> Result<DeviceKey> {
        let key = self
            .transition(device, key_type, |ring| {
                let next = ring.provision(material.clone(), Utc::now())?;
                let active = next.active().cloned();
                Ok((Some(next), active))
            })
            .await?
            .ok_or_else(|| KeyLifecycleError::NotProvisioned {
                device: *device,
                key_type,
            })?;

        info!(key_id = %key.id, "Provisioned key");
        Ok(key)
    }

    /// Stage a NEXT key with fresh material
    #[instrument(skip(self, material), fields(device = %device, key_type = %key_type))]
    pub async fn begin_rotation(
        &self,
        device: &DeviceId,
        key_type: KeyType,
        material: KeyMaterial,
    ) -> Result<DeviceKey> {
        let key = self
            .transition(device, key_type, |ring| {
                let next = ring.begin_rotation(material.clone(), Utc::now())?;
                let staged = next.next().cloned();
                Ok((Some(next), staged))
            })
            .await?
            .ok_or_else(|| KeyLifecycleError::NoPendingRotation {
                device: *device,
                key_type,
            })?;

        info!(key_id = %key.id, "Rotation started");
        Ok(key)
    }

    /// Promote NEXT to ACTIVE after the device confirmed installation
    #[instrument(skip(self), fields(device = %device, key_type = %key_type))]
    pub async fn commit_rotation(
        &self,
        device: &DeviceId,
        key_type: KeyType,
    ) -> Result<RotationCommit> {
        self.commit(device, key_type, None).await
    }

    /// Promote `delivered` to ACTIVE, provided it is still the pending NEXT
    ///
    /// Fails with `NextReplaced` when the rotation was cancelled and restarted
    /// while `delivered` was on its way to the device.
    #[instrument(skip(self), fields(device = %device, key_type = %key_type, key_id = %delivered))]
    pub async fn commit_delivered(
        &self,
        device: &DeviceId,
        key_type: KeyType,
        delivered: DeviceKeyId,
    ) -> Result<RotationCommit> {
        self.commit(device, key_type, Some(delivered)).await
    }

    async fn commit(
        &self,
        device: &DeviceId,
        key_type: KeyType,
        delivered: Option<DeviceKeyId>,
    ) -> Result<RotationCommit> {
        let commit = self
            .transition(device, key_type, |ring| {
                let expired = ring.active().cloned().map(|mut key| {
                    key.status = KeyStatus::Expired;
                    key
                });
                let next = match delivered {
                    Some(id) => ring.commit_rotation_of(id)?,
                    None => ring.commit_rotation()?,
                };
                let commit = next.active().cloned().map(|activated| RotationCommit {
                    activated,
                    expired,
                });
                Ok((Some(next), commit))
            })
            .await?
            .ok_or_else(|| KeyLifecycleError::NoPendingRotation {
                device: *device,
                key_type,
            })?;

        info!(
            activated = %commit.activated.id,
            expired = ?commit.expired.as_ref().map(|k| k.id),
            "Rotation committed"
        );
        Ok(commit)
    }

    /// Abandon a pending NEXT key, returning it as EXPIRED
    #[instrument(skip(self), fields(device = %device, key_type = %key_type))]
    pub async fn cancel_rotation(&self, device: &DeviceId, key_type: KeyType) -> Result<DeviceKey> {
        let key = self
            .transition(device, key_type, |ring| {
                let cancelled = ring.next().map(|k| k.id);
                let next = ring.cancel_rotation()?;
                let key = next
                    .history
                    .iter()
                    .rev()
                    .find(|k| Some(k.id) == cancelled)
                    .cloned();
                Ok((Some(next), key))
            })
            .await?
            .ok_or_else(|| KeyLifecycleError::NoPendingRotation {
                device: *device,
                key_type,
            })?;

        info!(key_id = %key.id, "Rotation cancelled");
        Ok(key)
    }

    /// Expire an overdue TLS key and report whether a rotation is needed
    #[instrument(skip(self), fields(device = %device, key_type = %key_type))]
    pub async fn expire_overdue(
        &self,
        device: &DeviceId,
        key_type: KeyType,
        now: DateTime<Utc>,
    ) -> Result<ExpiryOutcome> {
        let window = self.renewal_window;
        let outcome = self
            .transition(device, key_type, |ring| Ok(ring.expire_overdue(now, window)))
            .await?;

        if let Some(expired) = outcome.expired() {
            warn!(key_id = %expired, "ACTIVE key expired before replacement");
        }
        Ok(outcome)
    }

    /// Current ring snapshot
    pub async fn ring(&self, device: &DeviceId, key_type: KeyType) -> Result<KeyRing> {
        Ok(self.store.load_ring(device, key_type).await?)
    }

    /// Every key row of a (device, key type), history included
    pub async fn keys(&self, device: &DeviceId, key_type: KeyType) -> Result<Vec<DeviceKey>> {
        Ok(self.ring(device, key_type).await?.rows())
    }

    async fn transition<T, F>(&self, device: &DeviceId, key_type: KeyType, decide: F) -> Result<T>
    where
        F: Fn(&KeyRing) -> Result<(Option<KeyRing>, T)>,
    {
        for attempt in 1..=self.max_attempts {
            let ring = self.store.load_ring(device, key_type).await?;
            let (next, out) = decide(&ring)?;
            let Some(next) = next else {
                return Ok(out);
            };

            match self.store.compare_and_swap_ring(ring.revision, next).await {
                Ok(()) => return Ok(out),
                Err(e) if e.is_stale() => {
                    debug!(attempt, error = %e, "Lost key ring update, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(KeyLifecycleError::StaleState {
            device: *device,
            key_type,
            attempts: self.max_attempts,
        })
    }
}
