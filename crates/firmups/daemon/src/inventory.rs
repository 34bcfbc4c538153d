//! Seed inventory
//!
//! A JSON document describing device types, firmware and devices, loaded into
//! the in-memory store at startup. Entities refer to each other by name
//! (firmware by name and version), never by id.
//!
//! ```json
//! {
//!   "device_types": [{ "name": "env-sensor",
//!                      "parameters": [{ "key": "interval", "type": "INTEGER", "default": 60 }] }],
//!   "firmware": [{ "name": "env-fw", "version": "1.0.0", "image": "...",
//!                  "compatible_with": ["env-sensor"] }],
//!   "devices": [{ "name": "env-001", "device_type": "env-sensor",
//!                 "desired": { "name": "env-fw", "version": "1.0.0" },
//!                 "keys": [{ "type": "TLS", "valid_for_days": 3 }] }]
//! }
//! ```

use crate::error::{DaemonError, DaemonResult};
use crate::storage::{
    DeviceStorage, DeviceTypeStorage, FirmwareStorage, InMemoryStorage, ParameterStorage,
};
use chrono::{Duration, Utc};
use firmups_keys::{IssuePolicy, KeyIssuer, KeyLifecycleManager};
use firmups_params::TypedValue;
use firmups_types::{
    Device, DeviceParameter, DeviceStatus, DeviceType, Firmware, FirmwareId, KeyMaterial, KeyType,
    ParameterSchema, ParameterType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Parsed inventory document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub device_types: Vec<DeviceTypeSeed>,
    #[serde(default)]
    pub firmware: Vec<FirmwareSeed>,
    #[serde(default)]
    pub devices: Vec<DeviceSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTypeSeed {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSeed {
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: ParameterType,
    /// JSON value; BINARY defaults are hex strings
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareSeed {
    pub name: String,
    pub version: String,
    /// Image contents; size and checksum are derived from it
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Device type names
    #[serde(default)]
    pub compatible_with: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub name: String,
    pub device_type: String,
    pub desired: FirmwareRef,
    #[serde(default)]
    pub current: Option<FirmwareRef>,
    #[serde(default = "default_status")]
    pub status: DeviceStatus,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub keys: Vec<KeySeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySeed {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    /// TLS only: days until the seeded certificate expires; may be negative
    #[serde(default)]
    pub valid_for_days: Option<i64>,
}

fn default_status() -> DeviceStatus {
    DeviceStatus::Active
}

/// Entities created by [`Inventory::apply`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventorySummary {
    pub device_types: usize,
    pub firmware: usize,
    pub compatibility: usize,
    pub devices: usize,
    pub keys: usize,
}

impl Inventory {
    /// Read an inventory file
    pub fn load(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Create every entity of the inventory
    ///
    /// Stops at the first rejected entity; entities created before it stay.
    pub async fn apply(
        &self,
        storage: &InMemoryStorage,
        keys: &KeyLifecycleManager,
        issuer: &dyn KeyIssuer,
        policy: &IssuePolicy,
    ) -> DaemonResult<InventorySummary> {
        let mut summary = InventorySummary::default();

        for seed in &self.device_types {
            let device_type = DeviceType::new(&seed.name)?;
            let id = device_type.id;
            storage.create_device_type(device_type).await?;
            for parameter in &seed.parameters {
                let default = parameter
                    .default
                    .as_ref()
                    .map(|v| typed_from_json(&parameter.key, parameter.value_type, v))
                    .transpose()?
                    .map(|v| v.encode());
                storage
                    .declare_parameter(ParameterSchema::new(
                        id,
                        &parameter.key,
                        parameter.value_type,
                        default,
                    )?)
                    .await?;
            }
            summary.device_types += 1;
        }

        for seed in &self.firmware {
            let firmware = seed.build()?;
            let id = firmware.id;
            storage.create_firmware(firmware).await?;
            summary.firmware += 1;

            for type_name in &seed.compatible_with {
                let device_type = storage
                    .find_device_type(type_name)
                    .await?
                    .ok_or_else(|| unknown("device type", type_name))?;
                storage.register_compatibility(&device_type.id, &id).await?;
                summary.compatibility += 1;
            }
        }

        for seed in &self.devices {
            let device_type = storage
                .find_device_type(&seed.device_type)
                .await?
                .ok_or_else(|| unknown("device type", &seed.device_type))?;
            let desired = resolve_firmware(storage, &seed.desired).await?;

            let mut device =
                Device::new(&seed.name, device_type.id, desired)?.with_status(seed.status);
            if let Some(current) = &seed.current {
                device = device.with_current_firmware(resolve_firmware(storage, current).await?);
            }
            let device = storage.create_device(device).await?;
            summary.devices += 1;

            for (key, value) in &seed.parameters {
                let schema = storage.validator().schema(&device_type.id, key)?;
                let value = match value {
                    serde_json::Value::Null => None,
                    v => Some(typed_from_json(key, schema.value_type, v)?.encode()),
                };
                storage
                    .set_parameter(DeviceParameter {
                        device: device.id,
                        key: key.clone(),
                        value_type: schema.value_type,
                        value,
                    })
                    .await?;
            }

            for key in &seed.keys {
                let material = match (key.key_type, key.valid_for_days) {
                    (KeyType::Tls, Some(days)) => {
                        let window = Duration::try_days(days)
                            .and_then(|d| Utc::now().checked_add_signed(d))
                            .and_then(|to| {
                                to.checked_sub_signed(policy.tls_validity)
                                    .map(|from| (from, to))
                            });
                        let Some((valid_from, valid_to)) = window else {
                            return Err(DaemonError::Inventory(format!(
                                "valid_for_days {} out of range for device '{}'",
                                days, seed.name
                            )));
                        };
                        KeyMaterial::Tls {
                            valid_from,
                            valid_to,
                        }
                    }
                    (key_type, _) => issuer
                        .issue(key_type, policy)
                        .await
                        .map_err(|e| DaemonError::Inventory(e.to_string()))?,
                };
                keys.provision(&device.id, key.key_type, material).await?;
                summary.keys += 1;
            }
        }

        info!(
            device_types = summary.device_types,
            firmware = summary.firmware,
            devices = summary.devices,
            keys = summary.keys,
            "Inventory loaded"
        );
        Ok(summary)
    }
}

impl FirmwareSeed {
    fn build(&self) -> DaemonResult<Firmware> {
        let declared = match (&self.sha256, self.size) {
            (Some(sha256), Some(size)) => Some(Firmware::new(
                &self.name,
                &self.version,
                self.file_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                size,
                sha256.clone(),
            )?),
            _ => None,
        };

        match (&self.image, declared) {
            (Some(image), Some(declared)) => {
                if !declared.verify_image(image.as_bytes()) {
                    return Err(DaemonError::Inventory(format!(
                        "image of firmware {} {} does not match its declared size and sha256",
                        self.name, self.version
                    )));
                }
                Ok(declared)
            }
            (Some(image), None) => Ok(Firmware::from_image(
                &self.name,
                &self.version,
                image.as_bytes(),
            )?),
            (None, Some(declared)) => Ok(declared),
            (None, None) => Err(DaemonError::Inventory(format!(
                "firmware {} {} needs either an image or size and sha256",
                self.name, self.version
            ))),
        }
    }
}

async fn resolve_firmware(storage: &InMemoryStorage, r: &FirmwareRef) -> DaemonResult<FirmwareId> {
    storage
        .find_firmware(&r.name, &r.version)
        .await?
        .map(|f| f.id)
        .ok_or_else(|| unknown("firmware", &format!("{} {}", r.name, r.version)))
}

fn unknown(kind: &str, name: &str) -> DaemonError {
    DaemonError::Inventory(format!("unknown {} '{}'", kind, name))
}

/// Convert a JSON literal into a value of the declared type
fn typed_from_json(
    key: &str,
    value_type: ParameterType,
    value: &serde_json::Value,
) -> DaemonResult<TypedValue> {
    let typed = match value_type {
        ParameterType::String => value.as_str().map(|s| TypedValue::String(s.to_owned())),
        ParameterType::Integer => value.as_i64().map(TypedValue::Integer),
        ParameterType::Boolean => value.as_bool().map(TypedValue::Boolean),
        ParameterType::Float => value.as_f64().map(|f| TypedValue::Float(f as f32)),
        ParameterType::Binary => value
            .as_str()
            .and_then(|s| hex::decode(s).ok())
            .map(TypedValue::Binary),
    };
    typed.ok_or_else(|| {
        DaemonError::Inventory(format!(
            "parameter '{}' expects {}, got {}",
            key, value_type, value
        ))
    })
}
