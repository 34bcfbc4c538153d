//! Rollout decisions and their outcomes

use firmups_types::{DeviceStatus, DeviceTypeId, FirmwareId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Operator policy applied on top of compatibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    /// Permit installing a lower semantic version than the current one
    #[serde(default = "default_true")]
    pub allow_downgrade: bool,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            allow_downgrade: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Why an install will not be issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolloutBlock {
    /// Desired firmware is not registered for the device type
    Incompatible {
        device_type: DeviceTypeId,
        firmware: FirmwareId,
    },

    /// Desired version is lower than the installed one and policy forbids it
    Downgrade { from: String, to: String },
}

impl fmt::Display for RolloutBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutBlock::Incompatible {
                device_type,
                firmware,
            } => write!(f, "{} is not compatible with {}", firmware, device_type),
            RolloutBlock::Downgrade { from, to } => {
                write!(f, "downgrade {} -> {} forbidden by policy", from, to)
            }
        }
    }
}

/// What it takes to move a device to its desired firmware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RolloutAction {
    /// Already running the desired firmware
    NoOp,

    /// Send an install command; upgrade and downgrade look the same
    InstallFirmware {
        firmware: FirmwareId,
        previous: Option<FirmwareId>,
    },

    /// Never dispatched
    Blocked(RolloutBlock),

    /// Device is not ACTIVE; recorded, not dispatched
    Deferred { status: DeviceStatus },
}

impl RolloutAction {
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, RolloutAction::InstallFirmware { .. })
    }
}

/// Observable result of applying an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing to do, or the install was already confirmed
    Unchanged,

    /// Install confirmed and recorded as current firmware
    Installed {
        firmware: FirmwareId,
        previous: Option<FirmwareId>,
    },

    Blocked(RolloutBlock),

    Deferred { status: DeviceStatus },

    /// The row was edited after planning and no longer calls for this action
    Superseded,

    /// Another dispatch to this device has not settled yet
    InFlight,

    /// Earlier dispatches failed; next attempt not before `retry_in`
    BackingOff { retry_in: Duration },
}
