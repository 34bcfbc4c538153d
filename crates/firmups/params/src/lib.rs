//! Firmups Params - Typed device parameters
//!
//! Device parameters are stored as raw bytes tagged with a declared type.
//! This crate provides:
//!
//! - **TypedValue**: Deterministic codec between raw bytes and typed values
//! - **ParameterSchemaValidator**: Checks values against a device type's
//!   declared schema and resolves explicit values or schema defaults
//!
//! Coercion is strict. Undeclared keys are always rejected, which is what
//! keeps devices from drifting away from their type.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod validator;
pub mod value;

pub use error::{ParameterError, Result};
pub use validator::ParameterSchemaValidator;
pub use value::TypedValue;
