//! Key lifecycle error types

use firmups_types::{DeviceId, DeviceKeyId, KeyType, StorageError, ValidationError};
use thiserror::Error;

/// Key lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyLifecycleError {
    #[error("{key_type} key already provisioned for {device}")]
    AlreadyProvisioned { device: DeviceId, key_type: KeyType },

    #[error("No ACTIVE {key_type} key for {device}")]
    NotProvisioned { device: DeviceId, key_type: KeyType },

    #[error("{key_type} rotation already in progress for {device}")]
    RotationInProgress { device: DeviceId, key_type: KeyType },

    #[error("No pending {key_type} rotation for {device}")]
    NoPendingRotation { device: DeviceId, key_type: KeyType },

    #[error("{key_type} key {delivered} for {device} was replaced by {pending} before commit")]
    NextReplaced {
        device: DeviceId,
        key_type: KeyType,
        delivered: DeviceKeyId,
        pending: DeviceKeyId,
    },

    #[error("Material for {found} offered to a {expected} key ring")]
    MaterialMismatch { expected: KeyType, found: KeyType },

    #[error("Invalid key material: {0}")]
    InvalidMaterial(#[from] ValidationError),

    #[error("{key_type} key ring for {device} still stale after {attempts} attempts")]
    StaleState {
        device: DeviceId,
        key_type: KeyType,
        attempts: u32,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl KeyLifecycleError {
    /// Transient failure; the same call may succeed on a later pass
    pub fn is_retryable(&self) -> bool {
        match self {
            KeyLifecycleError::StaleState { .. } | KeyLifecycleError::NextReplaced { .. } => true,
            KeyLifecycleError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for key lifecycle operations
pub type Result<T> = std::result::Result<T, KeyLifecycleError>;
