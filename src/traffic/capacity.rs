//! Global in-flight accounting partitioned by priority.
//!
//! Callers pair every increment with a decrement when the work finishes or
//! fails to start. Nothing here expires, so a missed decrement is permanent
//! until corrected by hand.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::KeyValueBackend;
use crate::config::CapacityConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Other(format!("unknown priority: {s}")))
    }
}

/// Snapshot of the global ceiling and current usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalCapacity {
    pub ceiling: i64,
    pub usage_by_priority: BTreeMap<Priority, i64>,
    /// None when no mode has been stored.
    pub learning: Option<bool>,
}

impl GlobalCapacity {
    pub fn usage(&self, priority: Priority) -> i64 {
        self.usage_by_priority.get(&priority).copied().unwrap_or(0)
    }

    pub fn total_usage(&self) -> i64 {
        self.usage_by_priority.values().sum()
    }

    /// Usage has reached the ceiling.
    pub fn is_saturated(&self) -> bool {
        self.total_usage() >= self.ceiling
    }
}

/// Priority-tiered usage counters in the shared backend.
///
/// Keys, with `C` the configured prefix: `C.global` (fields `ceiling`,
/// `learning`) and `C.usage` (one field per priority).
#[derive(Clone)]
pub struct PriorityCapacityTracker {
    backend: Arc<dyn KeyValueBackend>,
    config: CapacityConfig,
    global_key: String,
    usage_key: String,
}

impl PriorityCapacityTracker {
    pub fn new(backend: Arc<dyn KeyValueBackend>, config: CapacityConfig) -> Self {
        let global_key = format!("{}.global", config.key_prefix);
        let usage_key = format!("{}.usage", config.key_prefix);
        Self {
            backend,
            config,
            global_key,
            usage_key,
        }
    }

    /// Returns the new usage for `priority`.
    pub async fn increment_executions(&self, priority: Priority) -> Result<i64> {
        self.adjust(priority, 1, "increment").await
    }

    /// Returns the new usage for `priority`.
    pub async fn decrement_executions(&self, priority: Priority) -> Result<i64> {
        self.adjust(priority, -1, "decrement").await
    }

    async fn adjust(&self, priority: Priority, delta: i64, direction: &'static str) -> Result<i64> {
        let usage = self
            .backend
            .hincr(&self.usage_key, priority.as_str(), delta)
            .await?;
        if usage < 0 {
            warn!(%priority, usage, "capacity usage below zero, unpaired decrement");
        } else {
            debug!(%priority, usage, direction, "capacity usage adjusted");
        }
        metrics::capacity_adjustments().add(
            1,
            &[
                KeyValue::new("priority", priority.as_str()),
                KeyValue::new("direction", direction),
            ],
        );
        Ok(usage)
    }

    pub async fn get_global_capacity(&self) -> Result<GlobalCapacity> {
        let global = self.backend.hgetall(&self.global_key).await?;
        let usage = self.backend.hgetall(&self.usage_key).await?;

        let ceiling = global
            .get("ceiling")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.config.ceiling);
        let learning = global.get("learning").and_then(|v| v.parse().ok());
        let usage_by_priority = Priority::ALL
            .into_iter()
            .map(|p| {
                let n = usage.get(p.as_str()).and_then(|v| v.parse().ok());
                (p, n.unwrap_or(0))
            })
            .collect();

        Ok(GlobalCapacity {
            ceiling,
            usage_by_priority,
            learning,
        })
    }

    pub async fn set_ceiling(&self, ceiling: i64) -> Result<()> {
        self.backend
            .hset(&self.global_key, "ceiling", &ceiling.to_string())
            .await
    }

    pub async fn set_learning(&self, learning: bool) -> Result<()> {
        self.backend
            .hset(&self.global_key, "learning", &learning.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn saturation_compares_total_usage_to_ceiling() {
        let mut capacity = GlobalCapacity {
            ceiling: 3,
            usage_by_priority: Priority::ALL.into_iter().map(|p| (p, 0)).collect(),
            learning: None,
        };
        assert!(!capacity.is_saturated());
        capacity.usage_by_priority.insert(Priority::High, 2);
        capacity.usage_by_priority.insert(Priority::Low, 1);
        assert_eq!(capacity.total_usage(), 3);
        assert!(capacity.is_saturated());
    }
}
