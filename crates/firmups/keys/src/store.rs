//! Collaborator seams: key persistence and key issuance

use crate::ring::KeyRing;
use async_trait::async_trait;
use chrono::Duration;
use firmups_types::{CryptoAlgorithm, DeviceId, KeyMaterial, KeyType, StorageResult};
use thiserror::Error;

/// Persistence for key rings
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load the ring for a (device, key type) pair
    ///
    /// A pair with no keys yields an empty ring at revision 0.
    async fn load_ring(&self, device: &DeviceId, key_type: KeyType) -> StorageResult<KeyRing>;

    /// Replace the ring if its stored revision still equals `expected_revision`
    ///
    /// Fails with `StorageError::Stale` otherwise, writing nothing.
    async fn compare_and_swap_ring(&self, expected_revision: u64, ring: KeyRing)
        -> StorageResult<()>;
}

/// Parameters handed to the issuer for fresh material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuePolicy {
    /// Algorithm for lightweight keys
    pub algorithm: CryptoAlgorithm,

    /// Lifetime of issued TLS certificates
    pub tls_validity: Duration,
}

impl Default for IssuePolicy {
    fn default() -> Self {
        Self {
            algorithm: CryptoAlgorithm::AesGcm128,
            tls_validity: Duration::days(90),
        }
    }
}

/// Issuer failed to produce material
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("key issuance failed: {0}")]
pub struct IssueError(pub String);

/// Certificate / key issuance collaborator
#[async_trait]
pub trait KeyIssuer: Send + Sync {
    async fn issue(&self, key_type: KeyType, policy: &IssuePolicy)
        -> Result<KeyMaterial, IssueError>;
}
