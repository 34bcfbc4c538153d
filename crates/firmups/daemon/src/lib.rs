//! Firmups Daemon library
//!
//! This crate wires the reconciliation core into a runnable service:
//! - In-memory storage with relational integrity rules
//! - Fleet reconciliation controller (firmware rollout and key rotation)
//! - Simulated device link and key issuer
//! - Seed inventory loading
//! - Server lifecycle management

pub mod config;
pub mod controller;
pub mod error;
pub mod inventory;
pub mod server;
pub mod simulation;
pub mod storage;

pub use config::DaemonConfig;
pub use controller::{DeviceFailure, FailureStage, FleetReconciliationController, PassReport};
pub use error::{DaemonError, DaemonResult};
pub use inventory::Inventory;
pub use server::Server;
pub use storage::InMemoryStorage;
