//! Firmups Types - Core data model for embedded device fleets
//!
//! Firmups manages a fleet of networked embedded devices: their declared type,
//! the firmware image they should run, typed configuration parameters, and the
//! key material they use for secure communication.
//!
//! ## Key Concepts
//!
//! - **DeviceType**: Class of device sharing a parameter schema and a firmware
//!   compatibility set
//! - **Firmware**: Immutable image metadata (name, version, file id, size, SHA-256)
//! - **DeviceTypeFirmware**: Compatibility edge, the only authority for
//!   "can type T run firmware F"
//! - **Device**: A provisioned device with current and desired firmware
//! - **DeviceKey**: Key material in ACTIVE, NEXT, or EXPIRED status
//! - **Events**: Structured stream of reconciliation activity

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod device;
pub mod device_type;
pub mod error;
pub mod events;
pub mod firmware;
pub mod ids;
pub mod key;

pub use device::{Device, DeviceParameter, DeviceStatus};
pub use device_type::{DeviceType, DeviceTypeFirmware, ParameterSchema, ParameterType};
pub use error::{StorageError, StorageResult, ValidationError};
pub use events::{EventSeverity, EventSource, FleetEvent, FleetEventEnvelope};
pub use firmware::Firmware;
pub use ids::{DeviceId, DeviceKeyId, DeviceTypeId, FirmwareId};
pub use key::{CryptoAlgorithm, DeviceKey, KeyMaterial, KeyStatus, KeyType};

/// Maximum length of names, versions, and parameter keys.
pub const MAX_NAME_LEN: usize = 100;

/// Checks a human-facing name against the shared length rules.
pub fn validate_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}
