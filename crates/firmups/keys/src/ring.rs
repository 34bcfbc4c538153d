//! Key ring snapshots and their transitions
//!
//! Every transition consumes nothing and returns a fresh [`KeyRing`] with
//! `revision + 1`. Failed transitions leave the input untouched.

use crate::error::{KeyLifecycleError, Result};
use chrono::{DateTime, Duration, Utc};
use firmups_types::{DeviceId, DeviceKey, DeviceKeyId, KeyMaterial, KeyStatus, KeyType};
use serde::{Deserialize, Serialize};

/// Which keys of a ring are live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyRingState {
    /// No key has ever been provisioned
    Unprovisioned,

    /// One ACTIVE key, no rotation pending
    Active { active: DeviceKey },

    /// ACTIVE key plus a NEXT key awaiting device confirmation
    Rotating { active: DeviceKey, next: DeviceKey },

    /// The ACTIVE TLS key expired before a replacement was committed
    Lapsed { next: Option<DeviceKey> },
}

/// Result of checking a ring against the clock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Lightweight keys, or nothing provisioned yet
    NotApplicable,

    /// ACTIVE key is comfortably inside its validity window
    Current,

    /// ACTIVE key expires within the renewal window; still usable
    RenewalDue { valid_to: DateTime<Utc> },

    /// No usable ACTIVE key and no replacement started
    RotationRequired { expired: Option<DeviceKeyId> },

    /// A NEXT key already exists; it needs delivery and commit
    RotationPending { expired: Option<DeviceKeyId> },
}

impl ExpiryOutcome {
    /// Whether the caller should issue fresh material and begin a rotation
    pub fn needs_rotation(&self) -> bool {
        matches!(
            self,
            ExpiryOutcome::RenewalDue { .. } | ExpiryOutcome::RotationRequired { .. }
        )
    }

    /// Key that this check moved to EXPIRED
    pub fn expired(&self) -> Option<DeviceKeyId> {
        match self {
            ExpiryOutcome::RotationRequired { expired }
            | ExpiryOutcome::RotationPending { expired } => *expired,
            _ => None,
        }
    }
}

/// All keys of one (device, key type) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRing {
    pub device: DeviceId,
    pub key_type: KeyType,

    /// Bumped by every transition; used for compare-and-swap
    pub revision: u64,

    pub state: KeyRingState,

    /// EXPIRED keys, oldest first
    #[serde(default)]
    pub history: Vec<DeviceKey>,
}

impl KeyRing {
    pub fn empty(device: DeviceId, key_type: KeyType) -> Self {
        Self {
            device,
            key_type,
            revision: 0,
            state: KeyRingState::Unprovisioned,
            history: Vec::new(),
        }
    }

    pub fn active(&self) -> Option<&DeviceKey> {
        match &self.state {
            KeyRingState::Active { active } | KeyRingState::Rotating { active, .. } => {
                Some(active)
            }
            _ => None,
        }
    }

    pub fn next(&self) -> Option<&DeviceKey> {
        match &self.state {
            KeyRingState::Rotating { next, .. } => Some(next),
            KeyRingState::Lapsed { next } => next.as_ref(),
            _ => None,
        }
    }

    pub fn is_lapsed(&self) -> bool {
        matches!(self.state, KeyRingState::Lapsed { .. })
    }

    /// Every persisted row: ACTIVE, then NEXT, then history
    pub fn rows(&self) -> Vec<DeviceKey> {
        self.active()
            .into_iter()
            .chain(self.next())
            .chain(self.history.iter())
            .cloned()
            .collect()
    }

    /// Create the first ACTIVE key
    ///
    /// Also allowed on a lapsed ring with no pending replacement.
    pub fn provision(&self, material: KeyMaterial, now: DateTime<Utc>) -> Result<KeyRing> {
        match &self.state {
            KeyRingState::Unprovisioned | KeyRingState::Lapsed { next: None } => {
                let active = self.new_key(material, KeyStatus::Active, now)?;
                Ok(self.advance(KeyRingState::Active { active }, Vec::new()))
            }
            KeyRingState::Lapsed { next: Some(_) } => Err(self.rotation_in_progress()),
            KeyRingState::Active { .. } | KeyRingState::Rotating { .. } => {
                Err(KeyLifecycleError::AlreadyProvisioned {
                    device: self.device,
                    key_type: self.key_type,
                })
            }
        }
    }

    /// Stage replacement material as NEXT
    pub fn begin_rotation(&self, material: KeyMaterial, now: DateTime<Utc>) -> Result<KeyRing> {
        let state = match &self.state {
            KeyRingState::Active { active } => KeyRingState::Rotating {
                active: active.clone(),
                next: self.new_key(material, KeyStatus::Next, now)?,
            },
            KeyRingState::Lapsed { next: None } => KeyRingState::Lapsed {
                next: Some(self.new_key(material, KeyStatus::Next, now)?),
            },
            KeyRingState::Rotating { .. } | KeyRingState::Lapsed { next: Some(_) } => {
                return Err(self.rotation_in_progress())
            }
            KeyRingState::Unprovisioned => return Err(self.not_provisioned()),
        };
        Ok(self.advance(state, Vec::new()))
    }

    /// Promote NEXT to ACTIVE and expire the previous ACTIVE, in one step
    pub fn commit_rotation(&self) -> Result<KeyRing> {
        match &self.state {
            KeyRingState::Rotating { active, next } => Ok(self.advance(
                KeyRingState::Active {
                    active: with_status(next.clone(), KeyStatus::Active),
                },
                vec![active.clone()],
            )),
            KeyRingState::Lapsed { next: Some(next) } => Ok(self.advance(
                KeyRingState::Active {
                    active: with_status(next.clone(), KeyStatus::Active),
                },
                Vec::new(),
            )),
            KeyRingState::Unprovisioned => Err(self.not_provisioned()),
            KeyRingState::Active { .. } | KeyRingState::Lapsed { next: None } => {
                Err(self.no_pending_rotation())
            }
        }
    }

    /// Commit only if `delivered` is still the pending NEXT key
    pub fn commit_rotation_of(&self, delivered: DeviceKeyId) -> Result<KeyRing> {
        match self.next() {
            Some(next) if next.id != delivered => Err(KeyLifecycleError::NextReplaced {
                device: self.device,
                key_type: self.key_type,
                delivered,
                pending: next.id,
            }),
            _ => self.commit_rotation(),
        }
    }

    /// Abandon a pending NEXT key; it is kept as EXPIRED
    pub fn cancel_rotation(&self) -> Result<KeyRing> {
        match &self.state {
            KeyRingState::Rotating { active, next } => Ok(self.advance(
                KeyRingState::Active {
                    active: active.clone(),
                },
                vec![next.clone()],
            )),
            KeyRingState::Lapsed { next: Some(next) } => {
                Ok(self.advance(KeyRingState::Lapsed { next: None }, vec![next.clone()]))
            }
            _ => Err(self.no_pending_rotation()),
        }
    }

    /// Check TLS validity against `now`
    ///
    /// An ACTIVE key with `valid_to <= now` is moved to EXPIRED and the ring
    /// lapses. Returns the new ring only when something changed.
    pub fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        renewal_window: Duration,
    ) -> (Option<KeyRing>, ExpiryOutcome) {
        if self.key_type != KeyType::Tls {
            return (None, ExpiryOutcome::NotApplicable);
        }

        let overdue = |key: &DeviceKey| key.material.valid_to().is_some_and(|to| to <= now);

        match &self.state {
            KeyRingState::Unprovisioned => (None, ExpiryOutcome::NotApplicable),
            KeyRingState::Lapsed { next: None } => {
                (None, ExpiryOutcome::RotationRequired { expired: None })
            }
            KeyRingState::Lapsed { next: Some(_) } => {
                (None, ExpiryOutcome::RotationPending { expired: None })
            }
            KeyRingState::Active { active } if overdue(active) => (
                Some(self.advance(KeyRingState::Lapsed { next: None }, vec![active.clone()])),
                ExpiryOutcome::RotationRequired {
                    expired: Some(active.id),
                },
            ),
            KeyRingState::Rotating { active, next } if overdue(active) => (
                Some(self.advance(
                    KeyRingState::Lapsed {
                        next: Some(next.clone()),
                    },
                    vec![active.clone()],
                )),
                ExpiryOutcome::RotationPending {
                    expired: Some(active.id),
                },
            ),
            KeyRingState::Rotating { .. } => {
                (None, ExpiryOutcome::RotationPending { expired: None })
            }
            KeyRingState::Active { active } => match active.material.valid_to() {
                Some(valid_to) if valid_to - now <= renewal_window => {
                    (None, ExpiryOutcome::RenewalDue { valid_to })
                }
                _ => (None, ExpiryOutcome::Current),
            },
        }
    }

    fn new_key(
        &self,
        material: KeyMaterial,
        status: KeyStatus,
        now: DateTime<Utc>,
    ) -> Result<DeviceKey> {
        if material.key_type() != self.key_type {
            return Err(KeyLifecycleError::MaterialMismatch {
                expected: self.key_type,
                found: material.key_type(),
            });
        }
        material.validate()?;
        Ok(DeviceKey {
            id: DeviceKeyId::generate(),
            device: self.device,
            key_type: self.key_type,
            status,
            material,
            created_at: now,
        })
    }

    fn advance(&self, state: KeyRingState, retired: Vec<DeviceKey>) -> KeyRing {
        let mut history = self.history.clone();
        history.extend(
            retired
                .into_iter()
                .map(|key| with_status(key, KeyStatus::Expired)),
        );
        KeyRing {
            device: self.device,
            key_type: self.key_type,
            revision: self.revision + 1,
            state,
            history,
        }
    }

    fn not_provisioned(&self) -> KeyLifecycleError {
        KeyLifecycleError::NotProvisioned {
            device: self.device,
            key_type: self.key_type,
        }
    }

    fn rotation_in_progress(&self) -> KeyLifecycleError {
        KeyLifecycleError::RotationInProgress {
            device: self.device,
            key_type: self.key_type,
        }
    }

    fn no_pending_rotation(&self) -> KeyLifecycleError {
        KeyLifecycleError::NoPendingRotation {
            device: self.device,
            key_type: self.key_type,
        }
    }
}

fn with_status(mut key: DeviceKey, status: KeyStatus) -> DeviceKey {
    key.status = status;
    key
}
