//! Pass reports

use chrono::{DateTime, Utc};
use firmups_types::{DeviceId, KeyType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Part of the per-device work that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "key_type", rename_all = "snake_case")]
pub enum FailureStage {
    Firmware,
    Keys(KeyType),
}

/// One isolated failure; the rest of the pass carried on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFailure {
    pub device_id: DeviceId,
    pub stage: FailureStage,
    pub message: String,
    /// Picked up again on the next pass without intervention
    pub retryable: bool,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Devices whose work was scheduled
    pub devices_scanned: usize,
    pub installs: usize,
    pub deferred: usize,
    pub blocked: usize,
    /// In flight or waiting out a backoff delay
    pub backing_off: usize,
    pub keys_expired: usize,
    pub rotations_started: usize,
    pub rotations_committed: usize,

    pub failures: Vec<DeviceFailure>,

    /// Cancelled before every device was scheduled
    pub cancelled: bool,
}

impl PassReport {
    pub(crate) fn new(pass_id: Uuid) -> Self {
        Self {
            pass_id,
            started_at: Utc::now(),
            finished_at: None,
            devices_scanned: 0,
            installs: 0,
            deferred: 0,
            blocked: 0,
            backing_off: 0,
            keys_expired: 0,
            rotations_started: 0,
            rotations_committed: 0,
            failures: Vec::new(),
            cancelled: false,
        }
    }

    pub(crate) fn absorb(&mut self, device: DeviceReport) {
        self.installs += device.installs;
        self.deferred += device.deferred;
        self.blocked += device.blocked;
        self.backing_off += device.backing_off;
        self.keys_expired += device.keys_expired;
        self.rotations_started += device.rotations_started;
        self.rotations_committed += device.rotations_committed;
        self.failures.extend(device.failures);
    }

    pub(crate) fn finish(&mut self) {
        self.failures
            .sort_by(|a, b| a.device_id.cmp(&b.device_id));
        self.finished_at = Some(Utc::now());
    }

    /// No device reported a failure
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Devices with at least one failure
    pub fn failed_devices(&self) -> BTreeSet<DeviceId> {
        self.failures.iter().map(|f| f.device_id).collect()
    }
}

/// Per-device tally, folded into the pass report
#[derive(Debug)]
pub(crate) struct DeviceReport {
    pub device_id: DeviceId,
    pub installs: usize,
    pub deferred: usize,
    pub blocked: usize,
    pub backing_off: usize,
    pub keys_expired: usize,
    pub rotations_started: usize,
    pub rotations_committed: usize,
    pub failures: Vec<DeviceFailure>,
}

impl DeviceReport {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            installs: 0,
            deferred: 0,
            blocked: 0,
            backing_off: 0,
            keys_expired: 0,
            rotations_started: 0,
            rotations_committed: 0,
            failures: Vec::new(),
        }
    }

    pub fn fail(&mut self, stage: FailureStage, message: impl Into<String>, retryable: bool) {
        self.failures.push(DeviceFailure {
            device_id: self.device_id,
            stage,
            message: message.into(),
            retryable,
        });
    }
}
