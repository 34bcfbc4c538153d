//! Fleet reconciliation loop

use super::report::{DeviceReport, FailureStage, PassReport};
use crate::config::{KeysConfig, ReconcilerConfig};
use crate::storage::InMemoryStorage;
use chrono::Utc;
use firmups_keys::{IssuePolicy, KeyIssuer, KeyLifecycleError, KeyLifecycleManager, KeyStore};
use firmups_registry::CompatibilityRegistry;
use firmups_rollout::{
    ApplyOutcome, DeliveryOutcome, DeviceLink, DeviceStore, FirmwareRolloutReconciler,
    RolloutError,
};
use firmups_types::{
    Device, DeviceStatus, EventSeverity, EventSource, FleetEvent, FleetEventEnvelope, KeyType,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Drives firmware rollout and key rotation across the whole fleet
pub struct FleetReconciliationController {
    config: ReconcilerConfig,
    issue_policy: IssuePolicy,
    storage: Arc<InMemoryStorage>,
    rollout: FirmwareRolloutReconciler,
    keys: KeyLifecycleManager,
    link: Arc<dyn DeviceLink>,
    issuer: Arc<dyn KeyIssuer>,
    event_tx: broadcast::Sender<FleetEventEnvelope>,
    reconcile_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
}

impl FleetReconciliationController {
    /// Create a new controller
    ///
    /// The returned receiver carries on-demand triggers into [`run`](Self::run).
    pub fn new(
        config: ReconcilerConfig,
        keys: KeysConfig,
        storage: Arc<InMemoryStorage>,
        link: Arc<dyn DeviceLink>,
        issuer: Arc<dyn KeyIssuer>,
        event_tx: broadcast::Sender<FleetEventEnvelope>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (reconcile_tx, reconcile_rx) = mpsc::channel(10);

        let registry: Arc<dyn CompatibilityRegistry> = storage.registry();
        let devices: Arc<dyn DeviceStore> = storage.clone();
        let key_store: Arc<dyn KeyStore> = storage.clone();

        let rollout = FirmwareRolloutReconciler::new(
            registry,
            devices,
            link.clone(),
            config.rollout_config(),
        );
        let key_manager = KeyLifecycleManager::new(key_store)
            .with_max_attempts(config.max_cas_attempts)
            .with_renewal_window(keys.renewal_window());

        let controller = Arc::new(Self {
            config,
            issue_policy: keys.issue_policy(),
            storage,
            rollout,
            keys: key_manager,
            link,
            issuer,
            event_tx,
            reconcile_tx,
            shutdown: CancellationToken::new(),
        });

        (controller, reconcile_rx)
    }

    pub fn rollout(&self) -> &FirmwareRolloutReconciler {
        &self.rollout
    }

    pub fn keys(&self) -> &KeyLifecycleManager {
        &self.keys
    }

    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    /// Subscribe to fleet events
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEventEnvelope> {
        self.event_tx.subscribe()
    }

    /// Request a pass as soon as the loop is free
    ///
    /// Triggers arriving while one is already queued are coalesced.
    pub fn trigger_reconcile(&self) {
        if self.reconcile_tx.try_send(()).is_err() {
            debug!("Reconciliation already queued");
        }
    }

    /// Stop scheduling device work and end [`run`](Self::run)
    ///
    /// Devices already being reconciled finish their current step.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run passes on the configured interval and on every trigger
    pub async fn run(self: Arc<Self>, mut reconcile_rx: mpsc::Receiver<()>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.interval(), "Controller started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
                Some(_) = reconcile_rx.recv() => {
                    debug!("Triggered reconciliation");
                    self.run_pass().await;
                }
            }
        }

        info!("Controller stopped");
    }

    /// One sweep over every device
    ///
    /// Devices are reconciled independently, at most
    /// `max_concurrent_devices` at a time. A failure is recorded against its
    /// device and never stops the others. Shutdown stops new devices from
    /// being scheduled; the ones already started run to completion.
    pub async fn run_pass(self: &Arc<Self>) -> PassReport {
        let pass_id = Uuid::new_v4();
        let mut report = PassReport::new(pass_id);

        let devices = match self.storage.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                error!(pass_id = %pass_id, error = %e, "Failed to list devices");
                return self.complete(report);
            }
        };

        debug!(pass_id = %pass_id, devices = devices.len(), "Reconciliation pass started");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_devices.max(1)));
        let mut tasks = JoinSet::new();

        for device in devices {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let controller = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                controller.reconcile_device(pass_id, device).await
            });
            report.devices_scanned += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(device_report) => report.absorb(device_report),
                Err(e) => error!(pass_id = %pass_id, error = %e, "Device task aborted"),
            }
        }

        self.complete(report)
    }

    fn complete(&self, mut report: PassReport) -> PassReport {
        report.finish();

        let severity = if report.is_clean() {
            EventSeverity::Info
        } else {
            EventSeverity::Warning
        };
        self.emit(
            report.pass_id,
            FleetEvent::PassCompleted {
                pass_id: report.pass_id,
                devices_scanned: report.devices_scanned,
                failures: report.failures.len(),
                cancelled: report.cancelled,
            },
            EventSource::Controller,
            severity,
        );

        info!(
            pass_id = %report.pass_id,
            devices = report.devices_scanned,
            installs = report.installs,
            rotations = report.rotations_committed,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "Reconciliation pass completed"
        );
        report
    }

    async fn reconcile_device(&self, pass_id: Uuid, device: Device) -> DeviceReport {
        let mut report = DeviceReport::new(device.id);

        self.reconcile_firmware(pass_id, &device, &mut report).await;

        for key_type in KeyType::ALL {
            if let Err(e) = self
                .reconcile_keys(pass_id, &device, key_type, &mut report)
                .await
            {
                let retryable = e.is_retryable();
                self.key_failed(pass_id, &device, key_type, e.to_string(), retryable, &mut report);
            }
        }

        report
    }

    async fn reconcile_firmware(&self, pass_id: Uuid, device: &Device, report: &mut DeviceReport) {
        let action = match self.rollout.plan_for(device).await {
            Ok(action) => action,
            Err(e) => return self.rollout_failed(pass_id, device, e, report),
        };

        match self.rollout.apply(device, &action).await {
            Ok(ApplyOutcome::Unchanged) => {}
            Ok(ApplyOutcome::Superseded) => {
                debug!(device_id = %device.id, "Plan superseded by an edit, left for the next pass");
            }
            Ok(ApplyOutcome::Installed { firmware, previous }) => {
                self.emit(
                    pass_id,
                    FleetEvent::FirmwareInstallDispatched {
                        device_id: device.id,
                        firmware_id: firmware,
                        previous,
                    },
                    EventSource::Rollout,
                    EventSeverity::Info,
                );
                self.emit(
                    pass_id,
                    FleetEvent::FirmwareInstalled {
                        device_id: device.id,
                        firmware_id: firmware,
                    },
                    EventSource::Rollout,
                    EventSeverity::Info,
                );
                report.installs += 1;
            }
            Ok(ApplyOutcome::Blocked(block)) => {
                warn!(device_id = %device.id, reason = %block, "Rollout blocked");
                self.emit(
                    pass_id,
                    FleetEvent::RolloutBlocked {
                        device_id: device.id,
                        device_type: device.device_type,
                        firmware_id: device.desired_firmware,
                        reason: block.to_string(),
                    },
                    EventSource::Rollout,
                    EventSeverity::Warning,
                );
                report.blocked += 1;
            }
            Ok(ApplyOutcome::Deferred { status }) => {
                debug!(device_id = %device.id, status = %status, "Rollout deferred");
                self.emit(
                    pass_id,
                    FleetEvent::RolloutDeferred {
                        device_id: device.id,
                        status,
                    },
                    EventSource::Rollout,
                    EventSeverity::Debug,
                );
                report.deferred += 1;
            }
            Ok(ApplyOutcome::InFlight) | Ok(ApplyOutcome::BackingOff { .. }) => {
                report.backing_off += 1;
            }
            Err(e) => self.rollout_failed(pass_id, device, e, report),
        }
    }

    fn rollout_failed(
        &self,
        pass_id: Uuid,
        device: &Device,
        e: RolloutError,
        report: &mut DeviceReport,
    ) {
        match &e {
            RolloutError::DispatchTimeout {
                firmware, attempts, ..
            }
            | RolloutError::Rejected {
                firmware, attempts, ..
            } => {
                self.emit(
                    pass_id,
                    FleetEvent::FirmwareInstallDispatched {
                        device_id: device.id,
                        firmware_id: *firmware,
                        previous: device.current_firmware,
                    },
                    EventSource::Rollout,
                    EventSeverity::Info,
                );
                self.emit(
                    pass_id,
                    FleetEvent::FirmwareInstallFailed {
                        device_id: device.id,
                        firmware_id: *firmware,
                        attempts: *attempts,
                        reason: e.to_string(),
                    },
                    EventSource::Rollout,
                    EventSeverity::Warning,
                );
            }
            RolloutError::Superseded { .. } => {
                warn!(device_id = %device.id, error = %e, "Install outcome not recorded");
            }
            _ => {
                error!(device_id = %device.id, error = %e, "Firmware reconciliation failed");
            }
        }

        report.fail(FailureStage::Firmware, e.to_string(), e.is_retryable());
    }

    /// Expire, renew, deliver and commit keys of one type
    async fn reconcile_keys(
        &self,
        pass_id: Uuid,
        device: &Device,
        key_type: KeyType,
        report: &mut DeviceReport,
    ) -> Result<(), KeyLifecycleError> {
        let outcome = self
            .keys
            .expire_overdue(&device.id, key_type, Utc::now())
            .await?;

        if let Some(expired) = outcome.expired() {
            self.emit(
                pass_id,
                FleetEvent::KeyExpired {
                    device_id: device.id,
                    key_type,
                    key_id: expired,
                },
                EventSource::Keys,
                EventSeverity::Warning,
            );
            report.keys_expired += 1;
        }

        if outcome.needs_rotation() {
            let issued = timeout(
                self.config.call_timeout(),
                self.issuer.issue(key_type, &self.issue_policy),
            )
            .await;
            let material = match issued {
                Ok(Ok(material)) => material,
                Ok(Err(e)) => {
                    self.key_failed(pass_id, device, key_type, e.to_string(), true, report);
                    return Ok(());
                }
                Err(_) => {
                    let reason = "key issuance timed out";
                    self.key_failed(pass_id, device, key_type, reason, true, report);
                    return Ok(());
                }
            };

            let key = self
                .keys
                .begin_rotation(&device.id, key_type, material)
                .await?;
            self.emit(
                pass_id,
                FleetEvent::KeyRotationStarted {
                    device_id: device.id,
                    key_type,
                    key_id: key.id,
                },
                EventSource::Keys,
                EventSeverity::Info,
            );
            report.rotations_started += 1;
        }

        // A device that is not ACTIVE is not reachable for delivery
        if device.status != DeviceStatus::Active {
            return Ok(());
        }

        let ring = self.keys.ring(&device.id, key_type).await?;
        let Some(next) = ring.next() else {
            return Ok(());
        };
        let delivered_id = next.id;

        let delivered = timeout(
            self.config.call_timeout(),
            self.link.deliver_key(&device.id, next),
        )
        .await
        .unwrap_or(DeliveryOutcome::Timeout);

        match delivered {
            DeliveryOutcome::Ack => {
                let commit = self
                    .keys
                    .commit_delivered(&device.id, key_type, delivered_id)
                    .await?;
                self.emit(
                    pass_id,
                    FleetEvent::KeyRotationCommitted {
                        device_id: device.id,
                        key_type,
                        activated: commit.activated.id,
                        expired: commit.expired.map(|k| k.id),
                    },
                    EventSource::Keys,
                    EventSeverity::Info,
                );
                report.rotations_committed += 1;
            }
            DeliveryOutcome::Timeout => {
                let reason = "key delivery timed out";
                self.key_failed(pass_id, device, key_type, reason, true, report);
            }
        }

        Ok(())
    }

    fn key_failed(
        &self,
        pass_id: Uuid,
        device: &Device,
        key_type: KeyType,
        reason: impl Into<String>,
        retryable: bool,
        report: &mut DeviceReport,
    ) {
        let reason = reason.into();
        warn!(device_id = %device.id, key_type = %key_type, reason = %reason, "Key rotation step failed");
        self.emit(
            pass_id,
            FleetEvent::KeyRotationFailed {
                device_id: device.id,
                key_type,
                reason: reason.clone(),
            },
            EventSource::Keys,
            EventSeverity::Warning,
        );
        report.fail(FailureStage::Keys(key_type), reason, retryable);
    }

    /// Emit an event
    fn emit(&self, pass_id: Uuid, event: FleetEvent, source: EventSource, severity: EventSeverity) {
        let envelope = FleetEventEnvelope::new(event, source, severity)
            .with_pass(pass_id)
            .with_actor("controller");

        let _ = self.event_tx.send(envelope);
    }
}
