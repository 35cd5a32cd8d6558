//! Runtime settings for the coordinator.
//!
//! Every knob has a default suitable for production; individual values can be
//! overridden through environment variables (a `.env` file is honored via
//! `dotenvy`). Settings are read once at startup and shared immutably.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pairing service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSettings {
    /// How long an issued pair token stays valid.
    pub token_ttl_secs: u64,
    /// URI scheme used in the scan-to-pair payload.
    pub scheme: String,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            token_ttl_secs: 10 * 60,
            scheme: "drover".to_string(),
        }
    }
}

impl PairingSettings {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Device/agent registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Silence after which an agent and its devices are marked offline.
    pub heartbeat_timeout_secs: u64,
    /// How often the offline sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 15,
        }
    }
}

impl RegistrySettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Default attempt budget per job.
    pub max_attempts: u32,
    /// Base delay for the first retry; doubles per attempt.
    pub retry_base_secs: u64,
    /// Ceiling on the retry delay.
    pub retry_cap_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_secs: 30,
            retry_cap_secs: 15 * 60,
        }
    }
}

/// Run executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Upper bound on the random jitter added to the pacing interval.
    pub jitter_max_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { jitter_max_secs: 60 }
    }
}

/// Notification fanout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutSettings {
    /// Per-subscriber event buffer; a full buffer counts as a disconnect.
    pub subscriber_buffer: usize,
    /// How long subscriptions to a terminal run are kept for final delivery.
    pub terminal_grace_secs: u64,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
            terminal_grace_secs: 30,
        }
    }
}

impl FanoutSettings {
    pub fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_grace_secs)
    }
}

/// Top-level settings, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub pairing: PairingSettings,
    pub registry: RegistrySettings,
    pub queue: QueueSettings,
    pub executor: ExecutorSettings,
    pub fanout: FanoutSettings,
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// Reads a `.env` file if one is present. Unparseable values fall back
    /// to the default with a warning rather than aborting startup.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let mut settings = Self::default();
        read_env("DROVER_PAIR_TOKEN_TTL_SECS", &mut settings.pairing.token_ttl_secs);
        read_env_string("DROVER_PAIR_SCHEME", &mut settings.pairing.scheme);
        read_env(
            "DROVER_HEARTBEAT_TIMEOUT_SECS",
            &mut settings.registry.heartbeat_timeout_secs,
        );
        read_env(
            "DROVER_SWEEP_INTERVAL_SECS",
            &mut settings.registry.sweep_interval_secs,
        );
        read_env("DROVER_JOB_MAX_ATTEMPTS", &mut settings.queue.max_attempts);
        read_env("DROVER_RETRY_BASE_SECS", &mut settings.queue.retry_base_secs);
        read_env("DROVER_RETRY_CAP_SECS", &mut settings.queue.retry_cap_secs);
        read_env("DROVER_JITTER_MAX_SECS", &mut settings.executor.jitter_max_secs);
        read_env(
            "DROVER_SUBSCRIBER_BUFFER",
            &mut settings.fanout.subscriber_buffer,
        );
        read_env(
            "DROVER_TERMINAL_GRACE_SECS",
            &mut settings.fanout.terminal_grace_secs,
        );
        settings
    }
}

fn read_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}={:?}, using default", key, raw);
            }
        }
    }
}

fn read_env_string(key: &str, target: &mut String) {
    if let Ok(raw) = std::env::var(key) {
        if !raw.is_empty() {
            *target = raw;
        }
    }
}
