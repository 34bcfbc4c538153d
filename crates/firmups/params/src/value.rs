//! Typed parameter values and their byte encoding
//!
//! | Type    | Encoding                                |
//! |---------|-----------------------------------------|
//! | STRING  | UTF-8 bytes, any length                 |
//! | INTEGER | 8-byte big-endian two's complement i64  |
//! | BOOLEAN | exactly one byte, `0x00` or `0x01`      |
//! | FLOAT   | 4-byte big-endian IEEE-754 binary32     |
//! | BINARY  | raw bytes, unconstrained                |

use firmups_types::ParameterType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const INTEGER_WIDTH: usize = 8;
const FLOAT_WIDTH: usize = 4;

/// Raw bytes that do not decode as the expected type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode {expected}: {reason}")]
pub struct DecodeError {
    pub expected: ParameterType,
    pub reason: String,
}

impl DecodeError {
    fn new(expected: ParameterType, reason: impl Into<String>) -> Self {
        Self {
            expected,
            reason: reason.into(),
        }
    }
}

/// A decoded parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypedValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Float(f32),
    Binary(Vec<u8>),
}

impl TypedValue {
    pub fn value_type(&self) -> ParameterType {
        match self {
            TypedValue::String(_) => ParameterType::String,
            TypedValue::Integer(_) => ParameterType::Integer,
            TypedValue::Boolean(_) => ParameterType::Boolean,
            TypedValue::Float(_) => ParameterType::Float,
            TypedValue::Binary(_) => ParameterType::Binary,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            TypedValue::String(s) => s.as_bytes().to_vec(),
            TypedValue::Integer(i) => i.to_be_bytes().to_vec(),
            TypedValue::Boolean(b) => vec![u8::from(*b)],
            TypedValue::Float(f) => f.to_be_bytes().to_vec(),
            TypedValue::Binary(bytes) => bytes.clone(),
        }
    }

    pub fn decode(value_type: ParameterType, raw: &[u8]) -> Result<Self, DecodeError> {
        match value_type {
            ParameterType::String => std::str::from_utf8(raw)
                .map(|s| TypedValue::String(s.to_owned()))
                .map_err(|e| DecodeError::new(value_type, format!("invalid UTF-8: {}", e))),
            ParameterType::Integer => {
                let bytes: [u8; INTEGER_WIDTH] = raw.try_into().map_err(|_| {
                    DecodeError::new(
                        value_type,
                        format!("expected {} bytes, got {}", INTEGER_WIDTH, raw.len()),
                    )
                })?;
                Ok(TypedValue::Integer(i64::from_be_bytes(bytes)))
            }
            ParameterType::Boolean => match raw {
                [0] => Ok(TypedValue::Boolean(false)),
                [1] => Ok(TypedValue::Boolean(true)),
                [other] => Err(DecodeError::new(
                    value_type,
                    format!("byte must be 0 or 1, got {}", other),
                )),
                _ => Err(DecodeError::new(
                    value_type,
                    format!("expected 1 byte, got {}", raw.len()),
                )),
            },
            ParameterType::Float => {
                let bytes: [u8; FLOAT_WIDTH] = raw.try_into().map_err(|_| {
                    DecodeError::new(
                        value_type,
                        format!("expected {} bytes, got {}", FLOAT_WIDTH, raw.len()),
                    )
                })?;
                Ok(TypedValue::Float(f32::from_be_bytes(bytes)))
            }
            ParameterType::Binary => Ok(TypedValue::Binary(raw.to_vec())),
        }
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::String(value.to_owned())
    }
}

impl From<i64> for TypedValue {
    fn from(value: i64) -> Self {
        TypedValue::Integer(value)
    }
}

impl From<bool> for TypedValue {
    fn from(value: bool) -> Self {
        TypedValue::Boolean(value)
    }
}

impl From<f32> for TypedValue {
    fn from(value: f32) -> Self {
        TypedValue::Float(value)
    }
}
