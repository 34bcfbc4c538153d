//! Device types, their parameter schemas, and firmware compatibility edges

use crate::{validate_name, DeviceTypeId, FirmwareId, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A class of device sharing a parameter schema and a firmware compatibility set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: DeviceTypeId,
    pub name: String,
}

impl DeviceType {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name("device type name", &name)?;
        Ok(Self {
            id: DeviceTypeId::generate(),
            name,
        })
    }
}

/// Declared value type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
    Float,
    Binary,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ParameterType::String => "STRING",
            ParameterType::Integer => "INTEGER",
            ParameterType::Boolean => "BOOLEAN",
            ParameterType::Float => "FLOAT",
            ParameterType::Binary => "BINARY",
        };
        f.write_str(label)
    }
}

/// One declared parameter of a device type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub device_type: DeviceTypeId,
    pub key: String,
    pub value_type: ParameterType,
    /// Encoded default, used when a device has no explicit value
    #[serde(default)]
    pub default_value: Option<Vec<u8>>,
}

impl ParameterSchema {
    pub fn new(
        device_type: DeviceTypeId,
        key: impl Into<String>,
        value_type: ParameterType,
        default_value: Option<Vec<u8>>,
    ) -> Result<Self, ValidationError> {
        let key = key.into();
        validate_name("parameter key", &key)?;
        Ok(Self {
            device_type,
            key,
            value_type,
            default_value,
        })
    }
}

/// Compatibility edge between a device type and a firmware image
///
/// A pair is either compatible or the edge does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceTypeFirmware {
    pub device_type: DeviceTypeId,
    pub firmware: FirmwareId,
}

impl DeviceTypeFirmware {
    pub fn new(device_type: DeviceTypeId, firmware: FirmwareId) -> Self {
        Self {
            device_type,
            firmware,
        }
    }
}

impl fmt::Display for DeviceTypeFirmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.device_type, self.firmware)
    }
}
