//! Parameter schema validation and value resolution

use crate::error::{ParameterError, Result};
use crate::value::TypedValue;
use dashmap::DashMap;
use firmups_types::{DeviceParameter, DeviceTypeId, ParameterSchema};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Validates device parameters against their device type's declared schema
pub struct ParameterSchemaValidator {
    schemas: DashMap<DeviceTypeId, HashMap<String, ParameterSchema>>,
}

impl ParameterSchemaValidator {
    pub fn new() -> Self {
        Self {
            schemas: DashMap::new(),
        }
    }

    /// Declare a parameter for a device type
    ///
    /// A declared default must itself decode as the declared type.
    pub fn register(&self, schema: ParameterSchema) -> Result<()> {
        firmups_types::validate_name("parameter key", &schema.key)?;
        if let Some(default) = &schema.default_value {
            TypedValue::decode(schema.value_type, default).map_err(|e| {
                ParameterError::TypeMismatch {
                    key: schema.key.clone(),
                    expected: schema.value_type,
                    reason: format!("invalid default: {}", e.reason),
                }
            })?;
        }

        let mut declared = self.schemas.entry(schema.device_type).or_default();
        if declared.contains_key(&schema.key) {
            return Err(ParameterError::DuplicateKey {
                device_type: schema.device_type,
                key: schema.key,
            });
        }

        debug!(
            device_type = %schema.device_type,
            key = %schema.key,
            value_type = %schema.value_type,
            "Declared parameter"
        );
        declared.insert(schema.key.clone(), schema);
        Ok(())
    }

    /// Remove a declaration, returning it if it existed
    pub fn remove(&self, device_type: &DeviceTypeId, key: &str) -> Option<ParameterSchema> {
        let removed = self
            .schemas
            .get_mut(device_type)
            .and_then(|mut declared| declared.remove(key));
        self.schemas
            .remove_if(device_type, |_, declared| declared.is_empty());
        removed
    }

    pub fn has_schemas(&self, device_type: &DeviceTypeId) -> bool {
        self.schemas
            .get(device_type)
            .is_some_and(|declared| !declared.is_empty())
    }

    /// All declarations of a device type, ordered by key
    pub fn schemas_for(&self, device_type: &DeviceTypeId) -> Vec<ParameterSchema> {
        let mut schemas: Vec<ParameterSchema> = self
            .schemas
            .get(device_type)
            .map(|declared| declared.values().cloned().collect())
            .unwrap_or_default();
        schemas.sort_by(|a, b| a.key.cmp(&b.key));
        schemas
    }

    pub fn schema(&self, device_type: &DeviceTypeId, key: &str) -> Result<ParameterSchema> {
        self.schemas
            .get(device_type)
            .and_then(|declared| declared.get(key).cloned())
            .ok_or_else(|| ParameterError::UnknownParameter {
                device_type: *device_type,
                key: key.to_string(),
            })
    }

    /// Decode a raw value for `key` under the device type's schema
    pub fn validate(
        &self,
        device_type: &DeviceTypeId,
        key: &str,
        raw: &[u8],
    ) -> Result<TypedValue> {
        let schema = self.schema(device_type, key)?;
        decode_for(&schema, raw)
    }

    /// Check a stored parameter row: declared key, matching type, decodable value
    pub fn validate_parameter(
        &self,
        device_type: &DeviceTypeId,
        parameter: &DeviceParameter,
    ) -> Result<Option<TypedValue>> {
        let schema = self.schema(device_type, &parameter.key)?;
        if parameter.value_type != schema.value_type {
            return Err(ParameterError::TypeMismatch {
                key: parameter.key.clone(),
                expected: schema.value_type,
                reason: format!("row declares {}", parameter.value_type),
            });
        }
        parameter
            .value
            .as_deref()
            .map(|raw| decode_for(&schema, raw))
            .transpose()
    }

    /// Explicit value if present, else schema default, else `MissingValue`
    pub fn resolve(
        &self,
        device_type: &DeviceTypeId,
        parameters: &[DeviceParameter],
        key: &str,
    ) -> Result<TypedValue> {
        self.resolve_optional(device_type, parameters, key)?
            .ok_or_else(|| ParameterError::MissingValue {
                key: key.to_string(),
            })
    }

    /// Like [`resolve`](Self::resolve) but an absent value is `Ok(None)`
    pub fn resolve_optional(
        &self,
        device_type: &DeviceTypeId,
        parameters: &[DeviceParameter],
        key: &str,
    ) -> Result<Option<TypedValue>> {
        let schema = self.schema(device_type, key)?;

        let explicit = parameters
            .iter()
            .find(|p| p.key == key)
            .and_then(|p| p.value.as_deref());

        match explicit.or(schema.default_value.as_deref()) {
            Some(raw) => decode_for(&schema, raw).map(Some),
            None => Ok(None),
        }
    }

    /// Effective value of every declared key for a device
    pub fn effective_parameters(
        &self,
        device_type: &DeviceTypeId,
        parameters: &[DeviceParameter],
    ) -> Result<BTreeMap<String, Option<TypedValue>>> {
        if let Some(undeclared) = parameters
            .iter()
            .find(|p| self.schema(device_type, &p.key).is_err())
        {
            return Err(ParameterError::UnknownParameter {
                device_type: *device_type,
                key: undeclared.key.clone(),
            });
        }

        self.schemas_for(device_type)
            .into_iter()
            .map(|schema| {
                let value = self.resolve_optional(device_type, parameters, &schema.key)?;
                Ok((schema.key, value))
            })
            .collect()
    }
}

impl Default for ParameterSchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_for(schema: &ParameterSchema, raw: &[u8]) -> Result<TypedValue> {
    TypedValue::decode(schema.value_type, raw).map_err(|e| ParameterError::TypeMismatch {
        key: schema.key.clone(),
        expected: schema.value_type,
        reason: e.reason,
    })
}
