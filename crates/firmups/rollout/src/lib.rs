//! Firmups Rollout - Moving devices toward their desired firmware
//!
//! The [`FirmwareRolloutReconciler`] has two halves:
//!
//! - `plan_for`: a pure decision from the device row plus compatibility
//!   lookups, yielding a [`RolloutAction`]
//! - `apply`: carries out an action at most once at a time per device,
//!   dispatching installs through a [`DeviceLink`] and recording the
//!   confirmed firmware through a [`DeviceStore`] compare-and-swap
//!
//! Planning then applying an unchanged device any number of times has the
//! same effect as doing it once. Failed dispatches back off exponentially per
//! device so an unreachable device is not hammered on every pass.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod action;
pub mod backoff;
pub mod error;
pub mod link;
pub mod reconciler;
pub mod store;

// Re-exports
pub use action::{ApplyOutcome, RolloutAction, RolloutBlock, RolloutPolicy};
pub use backoff::{Admission, BackoffPolicy, DispatchLedger, DispatchPermit};
pub use error::{Result, RolloutError};
pub use link::{DeliveryOutcome, DeviceLink, InstallOutcome};
pub use reconciler::{FirmwareRolloutReconciler, RolloutConfig};
pub use store::DeviceStore;
