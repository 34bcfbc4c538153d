//! Device key rows and key material

use crate::{DeviceId, DeviceKeyId, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Credential family a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    Lightweight,
    Tls,
}

impl KeyType {
    pub const ALL: [KeyType; 2] = [KeyType::Lightweight, KeyType::Tls];
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Lightweight => write!(f, "LIGHTWEIGHT"),
            KeyType::Tls => write!(f, "TLS"),
        }
    }
}

/// Lifecycle status of a key row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Active,
    Next,
    Expired,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "ACTIVE"),
            KeyStatus::Next => write!(f, "NEXT"),
            KeyStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Symmetric algorithm of a lightweight key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CryptoAlgorithm {
    #[serde(rename = "AES_GCM128")]
    AesGcm128,
    #[serde(rename = "ASCON_AEAD128")]
    AsconAead128,
}

impl CryptoAlgorithm {
    /// Required raw key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CryptoAlgorithm::AesGcm128 => 16,
            CryptoAlgorithm::AsconAead128 => 16,
        }
    }
}

impl fmt::Display for CryptoAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoAlgorithm::AesGcm128 => write!(f, "AES-GCM128"),
            CryptoAlgorithm::AsconAead128 => write!(f, "ASCON-AEAD128"),
        }
    }
}

/// Material owned by exactly one key row
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyMaterial {
    Lightweight {
        algorithm: CryptoAlgorithm,
        /// Wiped when the material is dropped
        key: Zeroizing<Vec<u8>>,
    },
    Tls {
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
    },
}

impl KeyMaterial {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyMaterial::Lightweight { .. } => KeyType::Lightweight,
            KeyMaterial::Tls { .. } => KeyType::Tls,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            KeyMaterial::Lightweight { algorithm, key } => {
                if key.len() != algorithm.key_len() {
                    return Err(ValidationError::InvalidKeyMaterial(format!(
                        "invalid key length {} for {}, should be {}",
                        key.len(),
                        algorithm,
                        algorithm.key_len()
                    )));
                }
            }
            KeyMaterial::Tls {
                valid_from,
                valid_to,
            } => {
                if valid_from >= valid_to {
                    return Err(ValidationError::InvalidKeyMaterial(format!(
                        "validity window is empty: {} >= {}",
                        valid_from, valid_to
                    )));
                }
            }
        }
        Ok(())
    }

    /// End of the validity window, for TLS material
    pub fn valid_to(&self) -> Option<DateTime<Utc>> {
        match self {
            KeyMaterial::Tls { valid_to, .. } => Some(*valid_to),
            KeyMaterial::Lightweight { .. } => None,
        }
    }
}

// Raw key bytes never reach the logs.
impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Lightweight { algorithm, key } => f
                .debug_struct("Lightweight")
                .field("algorithm", algorithm)
                .field("key", &format_args!("<{} bytes>", key.len()))
                .finish(),
            KeyMaterial::Tls {
                valid_from,
                valid_to,
            } => f
                .debug_struct("Tls")
                .field("valid_from", valid_from)
                .field("valid_to", valid_to)
                .finish(),
        }
    }
}

/// Persisted key row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKey {
    pub id: DeviceKeyId,
    pub device: DeviceId,
    pub key_type: KeyType,
    pub status: KeyStatus,
    pub material: KeyMaterial,
    pub created_at: DateTime<Utc>,
}
