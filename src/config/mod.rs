//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Tunables (timeouts, intervals, limits) live in [`Settings`]; every field
//! has a default, so the settings file is optional.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub settings: Settings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// `WORKQ_SETTINGS` optionally points at a TOML settings file.
    pub fn from_env() -> Result<Self> {
        let settings = match std::env::var("WORKQ_SETTINGS") {
            Ok(path) => Settings::from_file(Path::new(&path))?,
            Err(_) => Settings::default(),
        };
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// All tunables, one table per component.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub rate_limit: RateLimiterConfig,
    pub capacity: CapacityConfig,
    pub monitor: MonitorConfig,
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| Error::Config(format!("bad settings: {e}")))?
            .validate()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        toml::from_str::<Self>(&content)
            .map_err(|e| Error::Config(format!("bad settings file {}: {e}", path.display())))?
            .validate()
    }

    /// Reject values that would stall a loop or panic a ticker.
    pub fn validate(self) -> Result<Self> {
        let durations = [
            ("queue.ack_timeout_ms", self.queue.ack_timeout),
            ("queue.lock_ttl_ms", self.queue.lock_ttl),
            ("queue.retry_sweep_interval_ms", self.queue.retry_sweep_interval),
            ("worker.poll_interval_ms", self.worker.poll_interval),
            ("rate_limit.window_length_ms", self.rate_limit.window_length),
            (
                "monitor.gauge_registration_interval_ms",
                self.monitor.gauge_registration_interval,
            ),
            ("monitor.cleanup_interval_ms", self.monitor.cleanup_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        if self.worker.concurrency == 0 {
            return Err(Error::Config(
                "worker.concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Queue name; prefixes every storage key.
    pub name: String,
    /// Dead-letter sink name.
    pub dead_letter_name: String,
    /// How long a delivered message may stay unacked before `retry` reclaims it.
    #[serde(rename = "ack_timeout_ms", with = "duration_ms")]
    pub ack_timeout: Duration,
    /// Lease lock lifetime. Long on purpose so long-running jobs keep their lease.
    #[serde(rename = "lock_ttl_ms", with = "duration_ms")]
    pub lock_ttl: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_retries: u32,
    #[serde(rename = "retry_sweep_interval_ms", with = "duration_ms")]
    pub retry_sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "workq".to_string(),
            dead_letter_name: "workq.dead".to_string(),
            ack_timeout: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(24 * 60 * 60),
            max_retries: 5,
            retry_sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Number of polling loops `workq consume` starts.
    pub concurrency: usize,
    /// Sleep between polls that found nothing.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterConfig {
    pub key_prefix: String,
    #[serde(rename = "window_length_ms", with = "duration_ms")]
    pub window_length: Duration,
    pub default_capacity: i64,
    /// Default mode when neither the caller nor an override decides.
    pub learning: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "workq.ratelimit".to_string(),
            window_length: Duration::from_secs(1),
            default_capacity: 10,
            learning: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapacityConfig {
    pub key_prefix: String,
    /// Ceiling used when none is stored.
    pub ceiling: i64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            key_prefix: "workq.capacity".to_string(),
            ceiling: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub records_key: String,
    #[serde(rename = "gauge_registration_interval_ms", with = "duration_ms")]
    pub gauge_registration_interval: Duration,
    #[serde(rename = "cleanup_interval_ms", with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            records_key: "workq.active-executions".to_string(),
            gauge_registration_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Durations as integer milliseconds in the settings file.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
