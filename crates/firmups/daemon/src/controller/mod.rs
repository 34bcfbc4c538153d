//! Fleet reconciliation
//!
//! The controller walks every device on an interval or on demand, moving
//! firmware toward its target and keeping device keys rotated.

mod fleet;
mod report;

pub use fleet::FleetReconciliationController;
pub use report::{DeviceFailure, FailureStage, PassReport};
