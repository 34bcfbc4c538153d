//! Firmware image metadata
//!
//! Firmware is immutable once created. The image itself lives in an external
//! blob store and is referenced only by `file_id`; `size` and `sha256`
//! identify the exact image bytes.

use crate::{validate_name, FirmwareId, ValidationError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Maximum length of an opaque file identifier
pub const MAX_FILE_ID_LEN: usize = 36;

/// Immutable firmware image record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    pub id: FirmwareId,
    pub name: String,
    pub version: String,
    pub file_id: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the image
    pub sha256: String,
}

impl Firmware {
    /// Build a record from already-known metadata
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        file_id: impl Into<String>,
        size: u64,
        sha256: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let firmware = Self {
            id: FirmwareId::generate(),
            name: name.into(),
            version: version.into(),
            file_id: file_id.into(),
            size,
            sha256: sha256.into(),
        };
        firmware.validate()?;
        Ok(firmware)
    }

    /// Build a record from the image bytes, assigning a fresh file id
    pub fn from_image(
        name: impl Into<String>,
        version: impl Into<String>,
        image: &[u8],
    ) -> Result<Self, ValidationError> {
        Self::new(
            name,
            version,
            Uuid::new_v4().to_string(),
            image.len() as u64,
            checksum(image),
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name("firmware name", &self.name)?;
        validate_name("firmware version", &self.version)?;
        if self.file_id.is_empty() {
            return Err(ValidationError::Empty { field: "file id" });
        }
        if self.file_id.len() > MAX_FILE_ID_LEN {
            return Err(ValidationError::TooLong {
                field: "file id",
                max: MAX_FILE_ID_LEN,
            });
        }
        let well_formed = self.sha256.len() == 64
            && self
                .sha256
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return Err(ValidationError::InvalidChecksum(self.sha256.clone()));
        }
        Ok(())
    }

    /// Check image bytes against the recorded size and checksum
    pub fn verify_image(&self, image: &[u8]) -> bool {
        image.len() as u64 == self.size && checksum(image) == self.sha256
    }

    /// "name:version" label used in logs
    pub fn label(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

fn checksum(image: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image);
    hex::encode(hasher.finalize())
}
