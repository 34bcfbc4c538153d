//! Simulated collaborators
//!
//! Stand-ins for the device link and the key issuer so the daemon can run
//! against an in-memory fleet. Devices answer after a random latency and
//! occasionally time out or refuse an install.

use crate::config::SimulationConfig;
use async_trait::async_trait;
use chrono::Utc;
use firmups_keys::{IssueError, IssuePolicy, KeyIssuer};
use firmups_rollout::{DeliveryOutcome, DeviceLink, InstallOutcome};
use firmups_types::{DeviceId, DeviceKey, Firmware, KeyMaterial, KeyType};
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, Duration};
use tracing::debug;
use zeroize::Zeroizing;

/// Device link backed by dice rolls
pub struct SimulatedDeviceLink {
    config: SimulationConfig,
}

impl SimulatedDeviceLink {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    fn latency(&self) -> Duration {
        let mut rng = rand::rngs::StdRng::from_entropy();
        Duration::from_millis(rng.gen_range(0..=self.config.max_latency_ms))
    }
}

fn roll(rate: f64) -> bool {
    let mut rng = rand::rngs::StdRng::from_entropy();
    rng.gen_bool(rate.clamp(0.0, 1.0))
}

#[async_trait]
impl DeviceLink for SimulatedDeviceLink {
    async fn install_firmware(&self, device: &DeviceId, firmware: &Firmware) -> InstallOutcome {
        sleep(self.latency()).await;

        if roll(self.config.install_timeout_rate) {
            debug!(device_id = %device, firmware = %firmware.label(), "Simulated install timeout");
            return InstallOutcome::Timeout;
        }
        if roll(self.config.install_reject_rate) {
            debug!(device_id = %device, firmware = %firmware.label(), "Simulated install rejection");
            return InstallOutcome::Rejected("checksum mismatch reported by device".to_string());
        }
        InstallOutcome::Success
    }

    async fn deliver_key(&self, device: &DeviceId, key: &DeviceKey) -> DeliveryOutcome {
        sleep(self.latency()).await;

        if roll(self.config.delivery_timeout_rate) {
            debug!(device_id = %device, key_id = %key.id, "Simulated key delivery timeout");
            return DeliveryOutcome::Timeout;
        }
        DeliveryOutcome::Ack
    }
}

/// Issues random symmetric keys and fresh certificate windows
#[derive(Debug, Default)]
pub struct SimulatedKeyIssuer;

impl SimulatedKeyIssuer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KeyIssuer for SimulatedKeyIssuer {
    async fn issue(
        &self,
        key_type: KeyType,
        policy: &IssuePolicy,
    ) -> Result<KeyMaterial, IssueError> {
        let material = match key_type {
            KeyType::Lightweight => {
                let mut rng = rand::rngs::StdRng::from_entropy();
                let mut key = Zeroizing::new(vec![0u8; policy.algorithm.key_len()]);
                rng.fill(key.as_mut_slice());
                KeyMaterial::Lightweight {
                    algorithm: policy.algorithm,
                    key,
                }
            }
            KeyType::Tls => {
                let now = Utc::now();
                KeyMaterial::Tls {
                    valid_from: now,
                    valid_to: now + policy.tls_validity,
                }
            }
        };

        material
            .validate()
            .map_err(|e| IssueError(e.to_string()))?;
        Ok(material)
    }
}
