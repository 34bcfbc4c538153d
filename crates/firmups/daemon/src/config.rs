//! Configuration for firmupsd

use chrono::Duration as ChronoDuration;
use firmups_keys::IssuePolicy;
use firmups_rollout::{BackoffPolicy, RolloutConfig, RolloutPolicy};
use firmups_types::CryptoAlgorithm;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Reconciliation controller configuration
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Key rotation configuration
    #[serde(default)]
    pub keys: KeysConfig,

    /// Simulated device behaviour
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON inventory loaded into the in-memory store at startup
    #[serde(default)]
    pub inventory: Option<String>,
}

/// Reconciliation controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Interval between passes in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Devices reconciled concurrently within a pass
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_devices: usize,

    /// Timeout for a single device or issuer call in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Compare-and-swap attempts before a write is reported stale
    #[serde(default = "default_cas_attempts")]
    pub max_cas_attempts: u32,

    /// First retry delay after a failed dispatch, in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Retry delay ceiling, in seconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Permit installing a lower semantic version
    #[serde(default = "default_true")]
    pub allow_downgrade: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_concurrent_devices: default_max_concurrent(),
            call_timeout_ms: default_call_timeout(),
            max_cas_attempts: default_cas_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            allow_downgrade: true,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn rollout_config(&self) -> RolloutConfig {
        RolloutConfig {
            policy: RolloutPolicy {
                allow_downgrade: self.allow_downgrade,
            },
            call_timeout: self.call_timeout(),
            max_cas_attempts: self.max_cas_attempts.max(1),
            backoff: BackoffPolicy {
                base: Duration::from_secs(self.backoff_base_secs),
                max: Duration::from_secs(self.backoff_max_secs),
            },
        }
    }
}

/// Key rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Start renewing TLS keys this many days before they expire
    #[serde(default = "default_renewal_window")]
    pub renewal_window_days: i64,

    /// Validity of newly issued TLS certificates, in days
    #[serde(default = "default_tls_validity")]
    pub tls_validity_days: i64,

    /// Algorithm for newly issued lightweight keys
    #[serde(default = "default_algorithm")]
    pub algorithm: CryptoAlgorithm,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            renewal_window_days: default_renewal_window(),
            tls_validity_days: default_tls_validity(),
            algorithm: default_algorithm(),
        }
    }
}

/// Longest renewal window or certificate validity accepted, in days
pub const MAX_KEY_DAYS: i64 = 36_500;

impl KeysConfig {
    /// Reject durations outside what the key lifecycle can represent
    pub fn validate(&self) -> Result<(), String> {
        if !(0..=MAX_KEY_DAYS).contains(&self.renewal_window_days) {
            return Err(format!(
                "keys.renewal_window_days must be within 0..={}, got {}",
                MAX_KEY_DAYS, self.renewal_window_days
            ));
        }
        if !(1..=MAX_KEY_DAYS).contains(&self.tls_validity_days) {
            return Err(format!(
                "keys.tls_validity_days must be within 1..={}, got {}",
                MAX_KEY_DAYS, self.tls_validity_days
            ));
        }
        Ok(())
    }

    pub fn renewal_window(&self) -> ChronoDuration {
        ChronoDuration::days(self.renewal_window_days.clamp(0, MAX_KEY_DAYS))
    }

    pub fn issue_policy(&self) -> IssuePolicy {
        IssuePolicy {
            algorithm: self.algorithm,
            tls_validity: ChronoDuration::days(self.tls_validity_days.clamp(1, MAX_KEY_DAYS)),
        }
    }
}

/// Simulated device behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Probability an install never answers
    #[serde(default = "default_timeout_rate")]
    pub install_timeout_rate: f64,

    /// Probability an install is refused
    #[serde(default = "default_reject_rate")]
    pub install_reject_rate: f64,

    /// Probability a key delivery is not acknowledged
    #[serde(default = "default_timeout_rate")]
    pub delivery_timeout_rate: f64,

    /// Upper bound of simulated round-trip latency in milliseconds
    #[serde(default = "default_latency")]
    pub max_latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            install_timeout_rate: default_timeout_rate(),
            install_reject_rate: default_reject_rate(),
            delivery_timeout_rate: default_timeout_rate(),
            max_latency_ms: default_latency(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    16
}

fn default_call_timeout() -> u64 {
    5_000
}

fn default_cas_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_max() -> u64 {
    15 * 60
}

fn default_renewal_window() -> i64 {
    14
}

fn default_tls_validity() -> i64 {
    90
}

fn default_algorithm() -> CryptoAlgorithm {
    CryptoAlgorithm::AesGcm128
}

fn default_timeout_rate() -> f64 {
    0.05
}

fn default_reject_rate() -> f64 {
    0.01
}

fn default_latency() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then an optional file, then `FIRMUPS__*` env vars
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // e.g. FIRMUPS__RECONCILER__INTERVAL_SECS=10
        builder = builder.add_source(
            config::Environment::with_prefix("FIRMUPS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.keys.validate().map_err(config::ConfigError::Message)?;
        Ok(config)
    }
}
