//! Firmware rollout reconciler

use crate::action::{ApplyOutcome, RolloutAction, RolloutBlock, RolloutPolicy};
use crate::backoff::{Admission, BackoffPolicy, DispatchLedger};
use crate::error::{Result, RolloutError};
use crate::link::{DeviceLink, InstallOutcome};
use crate::store::DeviceStore;
use firmups_registry::CompatibilityRegistry;
use firmups_types::{Device, DeviceId, DeviceStatus, Firmware, FirmwareId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Reconciler tuning
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    pub policy: RolloutPolicy,

    /// Upper bound on a single install call
    pub call_timeout: Duration,

    /// Compare-and-swap attempts when recording an install
    pub max_cas_attempts: u32,

    pub backoff: BackoffPolicy,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            policy: RolloutPolicy::default(),
            call_timeout: Duration::from_secs(30),
            max_cas_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Plans and applies firmware changes for single devices
pub struct FirmwareRolloutReconciler {
    registry: Arc<dyn CompatibilityRegistry>,
    devices: Arc<dyn DeviceStore>,
    link: Arc<dyn DeviceLink>,
    ledger: DispatchLedger,
    config: RolloutConfig,
}

impl FirmwareRolloutReconciler {
    pub fn new(
        registry: Arc<dyn CompatibilityRegistry>,
        devices: Arc<dyn DeviceStore>,
        link: Arc<dyn DeviceLink>,
        config: RolloutConfig,
    ) -> Self {
        Self {
            registry,
            devices,
            link,
            ledger: DispatchLedger::new(config.backoff),
            config,
        }
    }

    pub fn ledger(&self) -> &DispatchLedger {
        &self.ledger
    }

    /// Decide what moves `device` toward its desired firmware
    ///
    /// Precedence: incompatible target, already converged, not ACTIVE,
    /// downgrade policy, install.
    #[instrument(skip(self, device), fields(device = %device.id))]
    pub async fn plan_for(&self, device: &Device) -> Result<RolloutAction> {
        let desired = device.desired_firmware;

        if !self
            .registry
            .is_compatible(&device.device_type, &desired)
            .await?
        {
            return Ok(RolloutAction::Blocked(RolloutBlock::Incompatible {
                device_type: device.device_type,
                firmware: desired,
            }));
        }

        if device.current_firmware == Some(desired) {
            return Ok(RolloutAction::NoOp);
        }

        if device.status != DeviceStatus::Active {
            return Ok(RolloutAction::Deferred {
                status: device.status,
            });
        }

        if let Some(current) = device.current_firmware {
            if !self.config.policy.allow_downgrade {
                if let Some(block) = self.downgrade_block(&current, &desired).await? {
                    return Ok(RolloutAction::Blocked(block));
                }
            }
        }

        Ok(RolloutAction::InstallFirmware {
            firmware: desired,
            previous: device.current_firmware,
        })
    }

    /// Carry out an action for a device
    ///
    /// Only `InstallFirmware` has side effects. An install already recorded
    /// as current, or one still in flight, is not dispatched again. If the
    /// row moved past the revision `device` was read at, the action is only
    /// dispatched when planning the current row yields the same action, and
    /// the confirmation is written against the revision that was checked.
    #[instrument(skip(self, device, action), fields(device = %device.id))]
    pub async fn apply(&self, device: &Device, action: &RolloutAction) -> Result<ApplyOutcome> {
        let (target, previous) = match action {
            RolloutAction::NoOp => {
                self.ledger.clear(&device.id);
                return Ok(ApplyOutcome::Unchanged);
            }
            RolloutAction::Blocked(block) => return Ok(ApplyOutcome::Blocked(block.clone())),
            RolloutAction::Deferred { status } => {
                return Ok(ApplyOutcome::Deferred { status: *status })
            }
            RolloutAction::InstallFirmware { firmware, previous } => (*firmware, *previous),
        };

        let fresh = self
            .devices
            .get_device(&device.id)
            .await?
            .ok_or(RolloutError::DeviceNotFound(device.id))?;
        if fresh.current_firmware == Some(target) {
            debug!(firmware = %target, "Install already recorded");
            self.ledger.clear(&device.id);
            return Ok(ApplyOutcome::Unchanged);
        }
        if fresh.revision != device.revision && self.plan_for(&fresh).await? != *action {
            debug!(
                planned_revision = device.revision,
                revision = fresh.revision,
                "Row changed since planning, install dropped"
            );
            return Ok(ApplyOutcome::Superseded);
        }

        let permit = match self.ledger.admit(&device.id, &target, Instant::now()) {
            Admission::Go(permit) => permit,
            Admission::InFlight => return Ok(ApplyOutcome::InFlight),
            Admission::BackingOff { remaining } => {
                debug!(retry_in = ?remaining, "Device backing off");
                return Ok(ApplyOutcome::BackingOff {
                    retry_in: remaining,
                });
            }
        };

        let firmware = self.firmware(&target).await?;
        info!(firmware = %firmware.label(), previous = ?previous, "Dispatching install");

        let outcome = tokio::time::timeout(
            self.config.call_timeout,
            self.link.install_firmware(&device.id, &firmware),
        )
        .await
        .unwrap_or(InstallOutcome::Timeout);

        match outcome {
            InstallOutcome::Success => {
                self.record_installed(&fresh, action, target).await?;
                permit.succeed();
                info!(firmware = %firmware.label(), "Install confirmed");
                Ok(ApplyOutcome::Installed {
                    firmware: target,
                    previous,
                })
            }
            InstallOutcome::Timeout => {
                let attempts = permit.fail(Instant::now());
                warn!(firmware = %firmware.label(), attempts, "Install timed out");
                Err(RolloutError::DispatchTimeout {
                    device: device.id,
                    firmware: target,
                    attempts,
                })
            }
            InstallOutcome::Rejected(reason) => {
                let attempts = permit.fail(Instant::now());
                warn!(firmware = %firmware.label(), attempts, reason = %reason, "Install rejected");
                Err(RolloutError::Rejected {
                    device: device.id,
                    firmware: target,
                    reason,
                    attempts,
                })
            }
        }
    }

    /// `plan_for` followed by `apply`
    pub async fn reconcile(&self, device: &Device) -> Result<(RolloutAction, ApplyOutcome)> {
        let action = self.plan_for(device).await?;
        let outcome = self.apply(device, &action).await?;
        Ok((action, outcome))
    }

    async fn firmware(&self, id: &FirmwareId) -> Result<Firmware> {
        self.registry
            .firmware(id)
            .await?
            .ok_or(RolloutError::FirmwareNotFound(*id))
    }

    async fn downgrade_block(
        &self,
        current: &FirmwareId,
        desired: &FirmwareId,
    ) -> Result<Option<RolloutBlock>> {
        let (Some(from), Some(to)) = (
            self.registry.firmware(current).await?,
            self.registry.firmware(desired).await?,
        ) else {
            return Ok(None);
        };

        match (
            semver::Version::parse(&from.version),
            semver::Version::parse(&to.version),
        ) {
            (Ok(from_v), Ok(to_v)) if to_v < from_v => Ok(Some(RolloutBlock::Downgrade {
                from: from.version,
                to: to.version,
            })),
            _ => Ok(None),
        }
    }

    /// Write `firmware` as current, conditioned on the revision of `basis`
    ///
    /// A lost race is retried only while the winning row still plans the
    /// same action; an edit that changed the plan surfaces as `Superseded`.
    async fn record_installed(
        &self,
        basis: &Device,
        action: &RolloutAction,
        firmware: FirmwareId,
    ) -> Result<()> {
        let mut expected = basis.revision;
        for attempt in 1..=self.config.max_cas_attempts {
            match self
                .devices
                .compare_and_set_current_firmware(&basis.id, expected, firmware)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_stale() => {
                    debug!(attempt, error = %e, "Lost device update");
                }
                Err(e) => return Err(e.into()),
            }

            let row = self
                .devices
                .get_device(&basis.id)
                .await?
                .ok_or(RolloutError::DeviceNotFound(basis.id))?;
            if row.current_firmware == Some(firmware) {
                return Ok(());
            }
            if self.plan_for(&row).await? != *action {
                return Err(RolloutError::Superseded {
                    device: basis.id,
                    firmware,
                });
            }
            expected = row.revision;
        }

        Err(RolloutError::StaleState {
            device: basis.id,
            attempts: self.config.max_cas_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DeliveryOutcome;
    use async_trait::async_trait;
    use firmups_registry::InMemoryCompatibilityRegistry;
    use firmups_types::{DeviceKey, DeviceTypeId, StorageError, StorageResult};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct TestDevices {
        rows: Mutex<HashMap<DeviceId, Device>>,
        /// Number of upcoming writes that lose to a concurrent writer
        stale_writes: AtomicUsize,
        /// Desired firmware an operator switches to just ahead of the next write
        retarget_on_write: std::sync::Mutex<Option<FirmwareId>>,
    }

    #[async_trait]
    impl DeviceStore for TestDevices {
        async fn get_device(&self, id: &DeviceId) -> StorageResult<Option<Device>> {
            Ok(self.rows.lock().await.get(id).cloned())
        }

        async fn list_devices(&self) -> StorageResult<Vec<Device>> {
            Ok(self.rows.lock().await.values().cloned().collect())
        }

        async fn compare_and_set_current_firmware(
            &self,
            id: &DeviceId,
            expected_revision: u64,
            firmware: FirmwareId,
        ) -> StorageResult<Device> {
            let mut rows = self.rows.lock().await;
            let row = rows
                .get_mut(id)
                .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
            if self
                .stale_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                row.revision += 1;
            }
            let retarget = self.retarget_on_write.lock().unwrap().take();
            if let Some(desired) = retarget {
                row.desired_firmware = desired;
                row.revision += 1;
            }
            if row.revision != expected_revision {
                return Err(StorageError::Stale {
                    entity: id.to_string(),
                    expected: expected_revision,
                    found: row.revision,
                });
            }
            row.current_firmware = Some(firmware);
            row.revision += 1;
            Ok(row.clone())
        }
    }

    struct ScriptedLink {
        outcome: InstallOutcome,
        installs: AtomicUsize,
    }

    impl ScriptedLink {
        fn new(outcome: InstallOutcome) -> Self {
            Self {
                outcome,
                installs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceLink for ScriptedLink {
        async fn install_firmware(&self, _: &DeviceId, _: &Firmware) -> InstallOutcome {
            self.installs.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }

        async fn deliver_key(&self, _: &DeviceId, _: &DeviceKey) -> DeliveryOutcome {
            DeliveryOutcome::Ack
        }
    }

    struct Fixture {
        reconciler: FirmwareRolloutReconciler,
        devices: Arc<TestDevices>,
        link: Arc<ScriptedLink>,
        t1: DeviceTypeId,
        f1: Firmware,
        f2: Firmware,
        f3: Firmware,
    }

    async fn fixture(outcome: InstallOutcome, policy: RolloutPolicy) -> Fixture {
        let registry = Arc::new(InMemoryCompatibilityRegistry::new());
        let t1 = DeviceTypeId::generate();
        let f1 = Firmware::from_image("sensor-fw", "1.0.0", b"v1.0").unwrap();
        let f2 = Firmware::from_image("sensor-fw", "1.1.0", b"v1.1").unwrap();
        let f3 = Firmware::from_image("sensor-fw", "3.0.0", b"v3.0").unwrap();
        registry.register(&t1, &f1).await.unwrap();
        registry.register(&t1, &f2).await.unwrap();

        let devices = Arc::new(TestDevices::default());
        let link = Arc::new(ScriptedLink::new(outcome));
        let config = RolloutConfig {
            policy,
            backoff: BackoffPolicy {
                base: Duration::from_secs(60),
                max: Duration::from_secs(600),
            },
            ..Default::default()
        };
        let reconciler =
            FirmwareRolloutReconciler::new(registry, devices.clone(), link.clone(), config);

        Fixture {
            reconciler,
            devices,
            link,
            t1,
            f1,
            f2,
            f3,
        }
    }

    impl Fixture {
        /// Apply an operator edit to the stored row
        async fn edit(&self, id: &DeviceId, change: impl FnOnce(&mut Device)) {
            let mut rows = self.devices.rows.lock().await;
            let row = rows.get_mut(id).unwrap();
            change(row);
            row.revision += 1;
        }

        async fn add(&self, device: Device) -> Device {
            self.devices
                .rows
                .lock()
                .await
                .insert(device.id, device.clone());
            device
        }
    }

    #[tokio::test]
    async fn test_upgrade_planned_for_compatible_target() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d1 = Device::new("d1", fx.t1, fx.f2.id)
            .unwrap()
            .with_current_firmware(fx.f1.id);

        let action = fx.reconciler.plan_for(&d1).await.unwrap();
        assert_eq!(
            action,
            RolloutAction::InstallFirmware {
                firmware: fx.f2.id,
                previous: Some(fx.f1.id)
            }
        );
        // Planning is a pure function of the row
        assert_eq!(fx.reconciler.plan_for(&d1).await.unwrap(), action);
    }

    #[tokio::test]
    async fn test_incompatible_target_is_blocked_before_anything_else() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d2 = fx
            .add(
                Device::new("d2", fx.t1, fx.f3.id)
                    .unwrap()
                    .with_current_firmware(fx.f1.id)
                    .with_status(DeviceStatus::Maintenance),
            )
            .await;

        let action = fx.reconciler.plan_for(&d2).await.unwrap();
        assert!(matches!(
            action,
            RolloutAction::Blocked(RolloutBlock::Incompatible { .. })
        ));
        let outcome = fx.reconciler.apply(&d2, &action).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Blocked(_)));
        assert_eq!(fx.link.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_maintenance_and_inactive_are_deferred() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        for status in [DeviceStatus::Maintenance, DeviceStatus::Inactive] {
            let device = fx
                .add(
                    Device::new("d4", fx.t1, fx.f2.id)
                        .unwrap()
                        .with_current_firmware(fx.f1.id)
                        .with_status(status),
                )
                .await;
            let action = fx.reconciler.plan_for(&device).await.unwrap();
            assert_eq!(action, RolloutAction::Deferred { status });
            assert_eq!(
                fx.reconciler.apply(&device, &action).await.unwrap(),
                ApplyOutcome::Deferred { status }
            );
        }
        assert_eq!(fx.link.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_install_and_converged_noop() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let fresh = Device::new("new", fx.t1, fx.f1.id).unwrap();
        assert_eq!(
            fx.reconciler.plan_for(&fresh).await.unwrap(),
            RolloutAction::InstallFirmware {
                firmware: fx.f1.id,
                previous: None
            }
        );

        let converged = fresh.with_current_firmware(fx.f1.id);
        assert_eq!(
            fx.reconciler.plan_for(&converged).await.unwrap(),
            RolloutAction::NoOp
        );
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d1 = fx
            .add(
                Device::new("d1", fx.t1, fx.f2.id)
                    .unwrap()
                    .with_current_firmware(fx.f1.id),
            )
            .await;

        let action = fx.reconciler.plan_for(&d1).await.unwrap();
        let first = fx.reconciler.apply(&d1, &action).await.unwrap();
        assert!(matches!(first, ApplyOutcome::Installed { .. }));

        // Same stale snapshot, same action: no second dispatch
        let second = fx.reconciler.apply(&d1, &action).await.unwrap();
        assert_eq!(second, ApplyOutcome::Unchanged);
        assert_eq!(fx.link.installs.load(Ordering::SeqCst), 1);

        let row = fx.devices.get_device(&d1.id).await.unwrap().unwrap();
        assert_eq!(row.current_firmware, Some(fx.f2.id));
        assert_eq!(fx.reconciler.plan_for(&row).await.unwrap(), RolloutAction::NoOp);
    }

    #[tokio::test]
    async fn test_timeout_backs_off_and_keeps_current() {
        let fx = fixture(InstallOutcome::Timeout, RolloutPolicy::default()).await;
        let d1 = fx
            .add(
                Device::new("d1", fx.t1, fx.f2.id)
                    .unwrap()
                    .with_current_firmware(fx.f1.id),
            )
            .await;

        let action = fx.reconciler.plan_for(&d1).await.unwrap();
        let err = fx.reconciler.apply(&d1, &action).await.unwrap_err();
        assert!(matches!(err, RolloutError::DispatchTimeout { attempts: 1, .. }));
        assert!(err.is_retryable());

        let row = fx.devices.get_device(&d1.id).await.unwrap().unwrap();
        assert_eq!(row.current_firmware, Some(fx.f1.id));

        // Immediately retrying is held back by the backoff window
        let outcome = fx.reconciler.apply(&d1, &action).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::BackingOff { .. }));
        assert_eq!(fx.link.installs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_retryable_failure() {
        let fx = fixture(
            InstallOutcome::Rejected("bad signature".into()),
            RolloutPolicy::default(),
        )
        .await;
        let d1 = fx.add(Device::new("d1", fx.t1, fx.f2.id).unwrap()).await;

        let action = fx.reconciler.plan_for(&d1).await.unwrap();
        let err = fx.reconciler.apply(&d1, &action).await.unwrap_err();
        assert!(matches!(err, RolloutError::Rejected { .. }));
        assert!(err.is_retryable());
        assert_eq!(fx.reconciler.ledger().failures(&d1.id), 1);
    }

    #[tokio::test]
    async fn test_lost_update_is_retried() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d1 = fx.add(Device::new("d1", fx.t1, fx.f2.id).unwrap()).await;
        fx.devices.stale_writes.store(2, Ordering::SeqCst);

        let action = fx.reconciler.plan_for(&d1).await.unwrap();
        let outcome = fx.reconciler.apply(&d1, &action).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Installed { .. }));
    }

    #[tokio::test]
    async fn test_persistent_contention_surfaces_stale_state() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d1 = fx.add(Device::new("d1", fx.t1, fx.f2.id).unwrap()).await;
        fx.devices.stale_writes.store(10, Ordering::SeqCst);

        let action = fx.reconciler.plan_for(&d1).await.unwrap();
        let err = fx.reconciler.apply(&d1, &action).await.unwrap_err();
        assert_eq!(
            err,
            RolloutError::StaleState {
                device: d1.id,
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_downgrade_policy() {
        let fx = fixture(
            InstallOutcome::Success,
            RolloutPolicy {
                allow_downgrade: false,
            },
        )
        .await;
        let down = Device::new("d5", fx.t1, fx.f1.id)
            .unwrap()
            .with_current_firmware(fx.f2.id);
        assert_eq!(
            fx.reconciler.plan_for(&down).await.unwrap(),
            RolloutAction::Blocked(RolloutBlock::Downgrade {
                from: "1.1.0".into(),
                to: "1.0.0".into()
            })
        );

        let up = Device::new("d6", fx.t1, fx.f2.id)
            .unwrap()
            .with_current_firmware(fx.f1.id);
        assert!(fx.reconciler.plan_for(&up).await.unwrap().is_dispatchable());
    }

    #[tokio::test]
    async fn test_retargeted_after_planning_is_not_dispatched() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d1 = fx
            .add(
                Device::new("d1", fx.t1, fx.f2.id)
                    .unwrap()
                    .with_current_firmware(fx.f1.id),
            )
            .await;
        let action = fx.reconciler.plan_for(&d1).await.unwrap();

        let f1 = fx.f1.id;
        fx.edit(&d1.id, |row| row.desired_firmware = f1).await;

        let outcome = fx.reconciler.apply(&d1, &action).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Superseded);
        assert_eq!(fx.link.installs.load(Ordering::SeqCst), 0);

        let row = fx.devices.get_device(&d1.id).await.unwrap().unwrap();
        assert_eq!(row.current_firmware, Some(fx.f1.id));
        assert_eq!(row.desired_firmware, fx.f1.id);
    }

    #[tokio::test]
    async fn test_maintenance_after_planning_is_not_dispatched() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d1 = fx.add(Device::new("d1", fx.t1, fx.f2.id).unwrap()).await;
        let action = fx.reconciler.plan_for(&d1).await.unwrap();

        fx.edit(&d1.id, |row| row.status = DeviceStatus::Maintenance)
            .await;

        assert_eq!(
            fx.reconciler.apply(&d1, &action).await.unwrap(),
            ApplyOutcome::Superseded
        );
        assert_eq!(fx.link.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_edit_that_keeps_the_plan_still_installs() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d1 = fx.add(Device::new("d1", fx.t1, fx.f2.id).unwrap()).await;
        let action = fx.reconciler.plan_for(&d1).await.unwrap();

        fx.edit(&d1.id, |row| row.name = "d1-renamed".into()).await;

        let outcome = fx.reconciler.apply(&d1, &action).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Installed { .. }));
        let row = fx.devices.get_device(&d1.id).await.unwrap().unwrap();
        assert_eq!(row.current_firmware, Some(fx.f2.id));
        assert_eq!(row.name, "d1-renamed");
    }

    #[tokio::test]
    async fn test_retarget_during_install_is_not_recorded() {
        let fx = fixture(InstallOutcome::Success, RolloutPolicy::default()).await;
        let d1 = fx
            .add(
                Device::new("d1", fx.t1, fx.f2.id)
                    .unwrap()
                    .with_current_firmware(fx.f1.id),
            )
            .await;
        *fx.devices.retarget_on_write.lock().unwrap() = Some(fx.f1.id);

        let action = fx.reconciler.plan_for(&d1).await.unwrap();
        let err = fx.reconciler.apply(&d1, &action).await.unwrap_err();
        assert_eq!(
            err,
            RolloutError::Superseded {
                device: d1.id,
                firmware: fx.f2.id
            }
        );
        assert!(err.is_retryable());
        assert_eq!(fx.link.installs.load(Ordering::SeqCst), 1);

        let row = fx.devices.get_device(&d1.id).await.unwrap().unwrap();
        assert_eq!(row.current_firmware, Some(fx.f1.id));
        assert_eq!(
            fx.reconciler.plan_for(&row).await.unwrap(),
            RolloutAction::NoOp
        );
    }
}
