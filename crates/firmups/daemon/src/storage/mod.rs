//! Storage layer
//!
//! Provides storage for fleet entities with the relational integrity rules
//! of the backing schema.

mod memory;
mod traits;

pub use memory::InMemoryStorage;
pub use traits::*;
