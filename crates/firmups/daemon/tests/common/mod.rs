//! Shared fixtures for daemon integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use firmups_daemon::config::{KeysConfig, ReconcilerConfig};
use firmups_daemon::storage::{DeviceStorage, DeviceTypeStorage, FirmwareStorage};
use firmups_daemon::{FleetReconciliationController, InMemoryStorage};
use firmups_keys::{IssueError, IssuePolicy, KeyIssuer};
use firmups_rollout::{DeliveryOutcome, DeviceLink, DeviceStore, InstallOutcome};
use firmups_types::{
    CryptoAlgorithm, Device, DeviceId, DeviceKey, DeviceKeyId, DeviceStatus, DeviceType, Firmware,
    FirmwareId, FleetEvent, FleetEventEnvelope, KeyMaterial, KeyType,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};

/// Parks one call until the test releases it
#[derive(Clone, Default)]
pub struct Hold {
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl Hold {
    async fn park(&self) {
        self.reached.notify_one();
        self.release.notified().await;
    }
}

/// Device link answering from per-device scripts
///
/// Devices without a script confirm everything.
#[derive(Default)]
pub struct ScriptedLink {
    installs: Mutex<HashMap<DeviceId, VecDeque<InstallOutcome>>>,
    deliveries: Mutex<HashMap<DeviceId, VecDeque<DeliveryOutcome>>>,
    silent: Mutex<HashSet<DeviceId>>,
    install_calls: Mutex<Vec<(DeviceId, FirmwareId)>>,
    delivered: Mutex<Vec<(DeviceId, DeviceKeyId)>>,
    install_hold: Mutex<Option<Hold>>,
    delivery_hold: Mutex<Option<Hold>>,
}

impl ScriptedLink {
    pub fn script_installs(
        &self,
        device: DeviceId,
        outcomes: impl IntoIterator<Item = InstallOutcome>,
    ) {
        self.installs
            .lock()
            .unwrap()
            .entry(device)
            .or_default()
            .extend(outcomes);
    }

    pub fn script_deliveries(
        &self,
        device: DeviceId,
        outcomes: impl IntoIterator<Item = DeliveryOutcome>,
    ) {
        self.deliveries
            .lock()
            .unwrap()
            .entry(device)
            .or_default()
            .extend(outcomes);
    }

    /// The device never answers an install
    pub fn silence(&self, device: DeviceId) {
        self.silent.lock().unwrap().insert(device);
    }

    /// The next install waits for `release` before answering
    pub fn hold_next_install(&self) -> Hold {
        let hold = Hold::default();
        *self.install_hold.lock().unwrap() = Some(hold.clone());
        hold
    }

    /// The next key delivery waits for `release` before answering
    pub fn hold_next_delivery(&self) -> Hold {
        let hold = Hold::default();
        *self.delivery_hold.lock().unwrap() = Some(hold.clone());
        hold
    }

    pub fn install_calls(&self) -> Vec<(DeviceId, FirmwareId)> {
        self.install_calls.lock().unwrap().clone()
    }

    pub fn installs_to(&self, device: &DeviceId) -> usize {
        self.install_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == device)
            .count()
    }

    pub fn delivered(&self) -> Vec<(DeviceId, DeviceKeyId)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceLink for ScriptedLink {
    async fn install_firmware(&self, device: &DeviceId, firmware: &Firmware) -> InstallOutcome {
        self.install_calls
            .lock()
            .unwrap()
            .push((*device, firmware.id));

        let silent = self.silent.lock().unwrap().contains(device);
        if silent {
            std::future::pending::<()>().await;
        }
        let hold = self.install_hold.lock().unwrap().take();
        if let Some(hold) = hold {
            hold.park().await;
        }

        self.installs
            .lock()
            .unwrap()
            .get_mut(device)
            .and_then(|script| script.pop_front())
            .unwrap_or(InstallOutcome::Success)
    }

    async fn deliver_key(&self, device: &DeviceId, key: &DeviceKey) -> DeliveryOutcome {
        let hold = self.delivery_hold.lock().unwrap().take();
        if let Some(hold) = hold {
            hold.park().await;
        }

        let outcome = self
            .deliveries
            .lock()
            .unwrap()
            .get_mut(device)
            .and_then(|script| script.pop_front())
            .unwrap_or(DeliveryOutcome::Ack);
        if outcome == DeliveryOutcome::Ack {
            self.delivered.lock().unwrap().push((*device, key.id));
        }
        outcome
    }
}

/// Issuer counting how often fresh material was requested
#[derive(Default)]
pub struct CountingIssuer {
    issued: AtomicUsize,
}

impl CountingIssuer {
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyIssuer for CountingIssuer {
    async fn issue(
        &self,
        key_type: KeyType,
        policy: &IssuePolicy,
    ) -> Result<KeyMaterial, IssueError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(match key_type {
            KeyType::Lightweight => KeyMaterial::Lightweight {
                algorithm: CryptoAlgorithm::AesGcm128,
                key: vec![n as u8; 16].into(),
            },
            KeyType::Tls => {
                let now = Utc::now();
                KeyMaterial::Tls {
                    valid_from: now,
                    valid_to: now + policy.tls_validity,
                }
            }
        })
    }
}

/// TLS material whose window ends `days` from now
pub fn tls_valid_for(days: i64) -> KeyMaterial {
    let valid_to = Utc::now() + chrono::Duration::days(days);
    KeyMaterial::Tls {
        valid_from: valid_to - chrono::Duration::days(90),
        valid_to,
    }
}

/// Reconciler settings that retry failed devices on the very next pass
pub fn eager_config() -> ReconcilerConfig {
    ReconcilerConfig {
        call_timeout_ms: 200,
        backoff_base_secs: 0,
        backoff_max_secs: 0,
        ..Default::default()
    }
}

/// Type T1 compatible with F1 (1.0.0) and F2 (1.1.0); F3 (2.0.0) exists but is not
pub struct Fleet {
    pub controller: Arc<FleetReconciliationController>,
    pub storage: Arc<InMemoryStorage>,
    pub link: Arc<ScriptedLink>,
    pub issuer: Arc<CountingIssuer>,
    pub events: broadcast::Receiver<FleetEventEnvelope>,
    pub t1: DeviceType,
    pub f1: Firmware,
    pub f2: Firmware,
    pub f3: Firmware,
}

impl Fleet {
    pub async fn new() -> Self {
        Self::with_config(eager_config()).await
    }

    pub async fn with_config(config: ReconcilerConfig) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let t1 = DeviceType::new("T1").unwrap();
        let f1 = Firmware::from_image("fw", "1.0.0", b"F1").unwrap();
        let f2 = Firmware::from_image("fw", "1.1.0", b"F2").unwrap();
        let f3 = Firmware::from_image("fw", "2.0.0", b"F3").unwrap();

        storage.create_device_type(t1.clone()).await.unwrap();
        for firmware in [&f1, &f2, &f3] {
            storage.create_firmware(firmware.clone()).await.unwrap();
        }
        storage.register_compatibility(&t1.id, &f1.id).await.unwrap();
        storage.register_compatibility(&t1.id, &f2.id).await.unwrap();

        let link = Arc::new(ScriptedLink::default());
        let issuer = Arc::new(CountingIssuer::default());
        let (event_tx, events) = broadcast::channel(1000);
        let (controller, _reconcile_rx) = FleetReconciliationController::new(
            config,
            KeysConfig::default(),
            storage.clone(),
            link.clone(),
            issuer.clone(),
            event_tx,
        );

        Self {
            controller,
            storage,
            link,
            issuer,
            events,
            t1,
            f1,
            f2,
            f3,
        }
    }

    pub async fn add_device(
        &self,
        name: &str,
        current: Option<&Firmware>,
        desired: &Firmware,
        status: DeviceStatus,
    ) -> Device {
        let mut device = Device::new(name, self.t1.id, desired.id)
            .unwrap()
            .with_status(status);
        if let Some(current) = current {
            device = device.with_current_firmware(current.id);
        }
        self.storage.create_device(device).await.unwrap()
    }

    pub async fn device(&self, id: &DeviceId) -> Device {
        self.storage.get_device(id).await.unwrap().unwrap()
    }

    /// Events published since the last drain
    pub fn drain_events(&mut self) -> Vec<FleetEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = self.events.try_recv() {
            events.push(envelope.event);
        }
        events
    }
}
