//! Firmups Registry - Device type / firmware compatibility
//!
//! The compatibility registry is the single authority for "can a device of
//! type T run firmware F". The rollout reconciler consults it once per
//! candidate firmware on every pass, so every query is answered from the
//! registry's own edge set without touching device rows.
//!
//! Devices *pin* the (type, firmware) pairs they currently run or desire.
//! Pins are what make `unregister` safe: an edge that is still pinned cannot
//! be removed.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod compatibility;
pub mod error;
pub mod memory;

// Re-exports
pub use compatibility::CompatibilityRegistry;
pub use error::{RegistryError, Result};
pub use memory::InMemoryCompatibilityRegistry;
