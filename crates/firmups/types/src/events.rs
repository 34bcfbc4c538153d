//! Event types for fleet observability
//!
//! Events provide a unified stream of rollout and key lifecycle activity.

use crate::{DeviceId, DeviceKeyId, DeviceStatus, DeviceTypeId, FirmwareId, KeyType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all fleet events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event source
    pub source: EventSource,

    /// Event severity
    pub severity: EventSeverity,

    /// Reconciliation pass that produced the event, if any
    pub pass_id: Option<Uuid>,

    /// Actor who triggered the event
    pub actor: Option<String>,

    /// The actual event
    pub event: FleetEvent,
}

impl FleetEventEnvelope {
    pub fn new(event: FleetEvent, source: EventSource, severity: EventSeverity) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source,
            severity,
            pass_id: None,
            actor: None,
            event,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_pass(mut self, pass_id: Uuid) -> Self {
        self.pass_id = Some(pass_id);
        self
    }
}

/// Event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// Fleet reconciliation controller
    Controller,
    /// Firmware rollout reconciler
    Rollout,
    /// Key lifecycle manager
    Keys,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Fleet events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FleetEvent {
    // ═══════════════════════════════════════════════════════════════════
    // FIRMWARE ROLLOUT EVENTS
    // ═══════════════════════════════════════════════════════════════════
    /// Install command sent to a device
    FirmwareInstallDispatched {
        device_id: DeviceId,
        firmware_id: FirmwareId,
        previous: Option<FirmwareId>,
    },

    /// Device confirmed the install and current firmware was updated
    FirmwareInstalled {
        device_id: DeviceId,
        firmware_id: FirmwareId,
    },

    /// Install timed out or was rejected; retried on a later pass
    FirmwareInstallFailed {
        device_id: DeviceId,
        firmware_id: FirmwareId,
        attempts: u32,
        reason: String,
    },

    /// Desired firmware cannot be installed on this device type
    RolloutBlocked {
        device_id: DeviceId,
        device_type: DeviceTypeId,
        firmware_id: FirmwareId,
        reason: String,
    },

    /// Install withheld because the device is not ACTIVE
    RolloutDeferred {
        device_id: DeviceId,
        status: DeviceStatus,
    },

    // ═══════════════════════════════════════════════════════════════════
    // KEY LIFECYCLE EVENTS
    // ═══════════════════════════════════════════════════════════════════
    /// ACTIVE key past its validity window was expired
    KeyExpired {
        device_id: DeviceId,
        key_type: KeyType,
        key_id: DeviceKeyId,
    },

    /// NEXT key created
    KeyRotationStarted {
        device_id: DeviceId,
        key_type: KeyType,
        key_id: DeviceKeyId,
    },

    /// NEXT key promoted to ACTIVE
    KeyRotationCommitted {
        device_id: DeviceId,
        key_type: KeyType,
        activated: DeviceKeyId,
        expired: Option<DeviceKeyId>,
    },

    /// Key rotation step failed; retried on a later pass
    KeyRotationFailed {
        device_id: DeviceId,
        key_type: KeyType,
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // PASS EVENTS
    // ═══════════════════════════════════════════════════════════════════
    /// Reconciliation pass finished
    PassCompleted {
        pass_id: Uuid,
        devices_scanned: usize,
        failures: usize,
        cancelled: bool,
    },
}

impl FleetEvent {
    /// Device the event concerns, if any
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            FleetEvent::FirmwareInstallDispatched { device_id, .. }
            | FleetEvent::FirmwareInstalled { device_id, .. }
            | FleetEvent::FirmwareInstallFailed { device_id, .. }
            | FleetEvent::RolloutBlocked { device_id, .. }
            | FleetEvent::RolloutDeferred { device_id, .. }
            | FleetEvent::KeyExpired { device_id, .. }
            | FleetEvent::KeyRotationStarted { device_id, .. }
            | FleetEvent::KeyRotationCommitted { device_id, .. }
            | FleetEvent::KeyRotationFailed { device_id, .. } => Some(device_id),
            FleetEvent::PassCompleted { .. } => None,
        }
    }
}
