//! Per-device dispatch bookkeeping
//!
//! The ledger admits at most one install per device at a time and spaces
//! retries after failures with exponential backoff:
//! `delay(n) = min(base * 2^(n-1), max)` for the n-th consecutive failure.
//! A new target firmware starts from a clean slate.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use firmups_types::{DeviceId, FirmwareId};
use std::time::{Duration, Instant};
use tracing::debug;

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct DispatchEntry {
    firmware: FirmwareId,
    in_flight: bool,
    failures: u32,
    retry_at: Option<Instant>,
}

/// Answer to "may this device be dispatched to now"
#[derive(Debug)]
pub enum Admission<'a> {
    Go(DispatchPermit<'a>),
    InFlight,
    BackingOff { remaining: Duration },
}

/// Outstanding claim on a device
///
/// Dropping an unsettled permit frees the device without counting a failure.
#[derive(Debug)]
pub struct DispatchPermit<'a> {
    ledger: &'a DispatchLedger,
    device: DeviceId,
    settled: bool,
}

impl DispatchPermit<'_> {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Install confirmed; forget the device
    pub fn succeed(mut self) {
        self.settled = true;
        self.ledger.entries.remove(&self.device);
    }

    /// Dispatch failed; returns the consecutive failure count
    pub fn fail(mut self, now: Instant) -> u32 {
        self.settled = true;
        self.ledger.record_failure(&self.device, now)
    }
}

impl Drop for DispatchPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            if let Some(mut entry) = self.ledger.entries.get_mut(&self.device) {
                entry.in_flight = false;
            }
        }
    }
}

/// Tracks in-flight installs and retry schedules per device
#[derive(Debug)]
pub struct DispatchLedger {
    entries: DashMap<DeviceId, DispatchEntry>,
    policy: BackoffPolicy,
}

impl DispatchLedger {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Claim the device for an install of `firmware`
    pub fn admit(&self, device: &DeviceId, firmware: &FirmwareId, now: Instant) -> Admission<'_> {
        match self.entries.entry(*device) {
            Entry::Vacant(slot) => {
                slot.insert(DispatchEntry {
                    firmware: *firmware,
                    in_flight: true,
                    failures: 0,
                    retry_at: None,
                });
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.in_flight {
                    return Admission::InFlight;
                }
                if entry.firmware != *firmware {
                    debug!(device = %device, firmware = %firmware, "Target changed, resetting backoff");
                    entry.firmware = *firmware;
                    entry.failures = 0;
                    entry.retry_at = None;
                }
                if let Some(retry_at) = entry.retry_at {
                    if retry_at > now {
                        return Admission::BackingOff {
                            remaining: retry_at - now,
                        };
                    }
                }
                entry.in_flight = true;
            }
        }

        Admission::Go(DispatchPermit {
            ledger: self,
            device: *device,
            settled: false,
        })
    }

    /// Consecutive failures recorded for a device
    pub fn failures(&self, device: &DeviceId) -> u32 {
        self.entries.get(device).map(|e| e.failures).unwrap_or(0)
    }

    /// Forget a device, e.g. once it has converged or was deleted
    pub fn clear(&self, device: &DeviceId) {
        self.entries.remove(device);
    }

    fn record_failure(&self, device: &DeviceId, now: Instant) -> u32 {
        match self.entries.get_mut(device) {
            Some(mut entry) => {
                entry.in_flight = false;
                entry.failures = entry.failures.saturating_add(1);
                entry.retry_at = Some(now + self.policy.delay(entry.failures));
                entry.failures
            }
            None => 0,
        }
    }
}
