//! Per-(namespace, subject) fixed-window rate limiting.
//!
//! Counts are exact and shared through the backend; the window is fixed, so
//! bursts at window boundaries are expected. A limiter in learning mode
//! computes decisions but never asks callers to wait.
//!
//! Keys, with `P` the configured prefix:
//!
//! - `P:<ns>:<subject>`: window counter, expires with the window
//! - `P.capacity`: overrides, fields `<ns>:<subject>` and `<ns>`
//! - `P.learning`: mode flags ("true"/"false"), same fields
//! - `P:<ns>.ignoring` / `P:<ns>.enforcing`: subjects pinned to a mode

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use rand::Rng;
use tracing::{debug, warn};

use crate::backend::KeyValueBackend;
use crate::config::RateLimiterConfig;
use crate::error::Result;
use crate::telemetry::metrics;

/// Base wait suggested to throttled callers.
const RETRY_AFTER_BASE: Duration = Duration::from_secs(3);
/// Upper bound of the random extra added to [`RETRY_AFTER_BASE`].
const RETRY_AFTER_JITTER_MS: u64 = 1_000;

/// Caller-supplied defaults for one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitContext {
    pub namespace: String,
    /// Capacity when no override is stored.
    pub capacity: i64,
    /// Mode when no override is stored.
    pub enforcing: bool,
}

impl RateLimitContext {
    pub fn new(namespace: impl Into<String>, capacity: i64, enforcing: bool) -> Self {
        Self {
            namespace: namespace.into(),
            capacity,
            enforcing,
        }
    }
}

/// The decision for one increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    /// The window's capacity is used up.
    pub limited: bool,
    /// How long an enforced caller should wait. Zero in learning mode.
    pub retry_after: Duration,
    /// Whether the caller should act on `limited`.
    pub enforced: bool,
    /// Hits in the current window, including this one.
    pub count: i64,
    /// Effective capacity after overrides.
    pub capacity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Learning,
    Enforcing,
}

/// One step of mode resolution. Steps run in order; the first that returns
/// a mode wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRule {
    /// Subject is in the namespace's ignoring set.
    IgnoredSubject,
    /// Subject is in the namespace's enforcing set.
    EnforcedSubject,
    /// Learning flag stored for the subject.
    SubjectFlag,
    /// Learning flag stored for the namespace.
    NamespaceFlag,
}

pub const MODE_RULES: [ModeRule; 4] = [
    ModeRule::IgnoredSubject,
    ModeRule::EnforcedSubject,
    ModeRule::SubjectFlag,
    ModeRule::NamespaceFlag,
];

/// One step of capacity resolution, same precedence contract as [`ModeRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityRule {
    SubjectOverride,
    NamespaceOverride,
}

pub const CAPACITY_RULES: [CapacityRule; 2] =
    [CapacityRule::SubjectOverride, CapacityRule::NamespaceOverride];

/// Key layout shared by resolution and the admin operations.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn window(&self, namespace: &str, subject: &str) -> String {
        format!("{}:{namespace}:{subject}", self.prefix)
    }

    fn capacity(&self) -> String {
        format!("{}.capacity", self.prefix)
    }

    fn learning(&self) -> String {
        format!("{}.learning", self.prefix)
    }

    fn ignoring(&self, namespace: &str) -> String {
        format!("{}:{namespace}.ignoring", self.prefix)
    }

    fn enforcing(&self, namespace: &str) -> String {
        format!("{}:{namespace}.enforcing", self.prefix)
    }
}

fn subject_field(namespace: &str, subject: &str) -> String {
    format!("{namespace}:{subject}")
}

/// Fixed-window limiter with learning/enforcing modes.
#[derive(Clone)]
pub struct TrafficShapingRateLimiter {
    backend: Arc<dyn KeyValueBackend>,
    config: RateLimiterConfig,
    keys: Keys,
}

impl TrafficShapingRateLimiter {
    pub fn new(backend: Arc<dyn KeyValueBackend>, config: RateLimiterConfig) -> Self {
        let keys = Keys {
            prefix: config.key_prefix.clone(),
        };
        Self {
            backend,
            config,
            keys,
        }
    }

    /// Context filled from configured defaults.
    pub fn default_context(&self, namespace: impl Into<String>) -> RateLimitContext {
        RateLimitContext::new(
            namespace,
            self.config.default_capacity,
            !self.config.learning,
        )
    }

    /// Count one hit for `subject` and decide whether it is over capacity.
    pub async fn increment_and_get(
        &self,
        subject: &str,
        ctx: &RateLimitContext,
    ) -> Result<RateLimit> {
        let key = self.keys.window(&ctx.namespace, subject);

        let count = self.backend.incr(&key, 1).await?;
        if count == 1 {
            // This hit opened the window.
            self.backend.expire(&key, self.config.window_length).await?;
        }

        let capacity = self.resolve_capacity(subject, ctx).await?;
        let limited = (capacity - count).max(0) == 0;
        let mode = self.resolve_mode(subject, ctx).await?;

        let decision = match mode {
            Mode::Learning => RateLimit {
                limited,
                retry_after: Duration::ZERO,
                enforced: false,
                count,
                capacity,
            },
            Mode::Enforcing => RateLimit {
                limited,
                retry_after: jittered_retry_after(),
                enforced: true,
                count,
                capacity,
            },
        };

        if limited {
            warn!(
                namespace = %ctx.namespace,
                subject,
                count,
                capacity,
                enforced = decision.enforced,
                "rate limit reached"
            );
        } else {
            debug!(namespace = %ctx.namespace, subject, count, capacity, "rate limit hit");
        }
        metrics::rate_limit_decisions().add(
            1,
            &[
                KeyValue::new("namespace", ctx.namespace.clone()),
                KeyValue::new("limited", limited),
                KeyValue::new("enforced", decision.enforced),
            ],
        );

        Ok(decision)
    }

    /// Capacity for `subject`: first stored override in [`CAPACITY_RULES`]
    /// order, else the context's default.
    pub async fn resolve_capacity(&self, subject: &str, ctx: &RateLimitContext) -> Result<i64> {
        for rule in CAPACITY_RULES {
            if let Some(capacity) = self.apply_capacity_rule(rule, subject, ctx).await? {
                return Ok(capacity);
            }
        }
        Ok(ctx.capacity)
    }

    async fn apply_capacity_rule(
        &self,
        rule: CapacityRule,
        subject: &str,
        ctx: &RateLimitContext,
    ) -> Result<Option<i64>> {
        let field = match rule {
            CapacityRule::SubjectOverride => subject_field(&ctx.namespace, subject),
            CapacityRule::NamespaceOverride => ctx.namespace.clone(),
        };
        let raw = self.backend.hget(&self.keys.capacity(), &field).await?;
        Ok(raw.and_then(|v| match v.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                warn!(field, value = %v, "ignoring unparseable capacity override");
                None
            }
        }))
    }

    /// Mode for `subject`: first definitive answer in [`MODE_RULES`] order,
    /// else the context's default.
    pub async fn resolve_mode(&self, subject: &str, ctx: &RateLimitContext) -> Result<Mode> {
        for rule in MODE_RULES {
            if let Some(mode) = self.apply_mode_rule(rule, subject, ctx).await? {
                return Ok(mode);
            }
        }
        Ok(if ctx.enforcing {
            Mode::Enforcing
        } else {
            Mode::Learning
        })
    }

    /// Evaluate one rule in isolation.
    pub async fn apply_mode_rule(
        &self,
        rule: ModeRule,
        subject: &str,
        ctx: &RateLimitContext,
    ) -> Result<Option<Mode>> {
        let ns = &ctx.namespace;
        match rule {
            ModeRule::IgnoredSubject => Ok(self
                .backend
                .sismember(&self.keys.ignoring(ns), subject)
                .await?
                .then_some(Mode::Learning)),
            ModeRule::EnforcedSubject => Ok(self
                .backend
                .sismember(&self.keys.enforcing(ns), subject)
                .await?
                .then_some(Mode::Enforcing)),
            ModeRule::SubjectFlag => self.learning_flag(&subject_field(ns, subject)).await,
            ModeRule::NamespaceFlag => self.learning_flag(ns).await,
        }
    }

    async fn learning_flag(&self, field: &str) -> Result<Option<Mode>> {
        let raw = self.backend.hget(&self.keys.learning(), field).await?;
        Ok(raw.and_then(|v| match v.parse::<bool>() {
            Ok(true) => Some(Mode::Learning),
            Ok(false) => Some(Mode::Enforcing),
            Err(_) => {
                warn!(field, value = %v, "ignoring unparseable learning flag");
                None
            }
        }))
    }

    // -----------------------------------------------------------------------
    // Overrides
    // -----------------------------------------------------------------------

    /// Store a capacity override. `subject = None` sets the namespace-wide one.
    pub async fn set_capacity_override(
        &self,
        namespace: &str,
        subject: Option<&str>,
        capacity: i64,
    ) -> Result<()> {
        let field = override_field(namespace, subject);
        self.backend
            .hset(&self.keys.capacity(), &field, &capacity.to_string())
            .await
    }

    pub async fn clear_capacity_override(
        &self,
        namespace: &str,
        subject: Option<&str>,
    ) -> Result<bool> {
        self.backend
            .hdel(&self.keys.capacity(), &override_field(namespace, subject))
            .await
    }

    /// Store a learning flag. `subject = None` sets the namespace-wide one.
    pub async fn set_learning_flag(
        &self,
        namespace: &str,
        subject: Option<&str>,
        learning: bool,
    ) -> Result<()> {
        let field = override_field(namespace, subject);
        self.backend
            .hset(&self.keys.learning(), &field, &learning.to_string())
            .await
    }

    pub async fn clear_learning_flag(&self, namespace: &str, subject: Option<&str>) -> Result<bool> {
        self.backend
            .hdel(&self.keys.learning(), &override_field(namespace, subject))
            .await
    }

    /// Pin a subject to learning mode regardless of flags.
    pub async fn add_ignored_subject(&self, namespace: &str, subject: &str) -> Result<()> {
        self.backend.sadd(&self.keys.ignoring(namespace), subject).await
    }

    pub async fn remove_ignored_subject(&self, namespace: &str, subject: &str) -> Result<bool> {
        self.backend.srem(&self.keys.ignoring(namespace), subject).await
    }

    /// Pin a subject to enforcing mode regardless of flags.
    pub async fn add_enforced_subject(&self, namespace: &str, subject: &str) -> Result<()> {
        self.backend.sadd(&self.keys.enforcing(namespace), subject).await
    }

    pub async fn remove_enforced_subject(&self, namespace: &str, subject: &str) -> Result<bool> {
        self.backend
            .srem(&self.keys.enforcing(namespace), subject)
            .await
    }
}

fn override_field(namespace: &str, subject: Option<&str>) -> String {
    match subject {
        Some(subject) => subject_field(namespace, subject),
        None => namespace.to_string(),
    }
}

fn jittered_retry_after() -> Duration {
    let jitter = rand::rng().random_range(0..=RETRY_AFTER_JITTER_MS);
    RETRY_AFTER_BASE + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_stays_near_three_seconds() {
        for _ in 0..100 {
            let d = jittered_retry_after();
            assert!(d >= Duration::from_secs(3));
            assert!(d <= Duration::from_secs(4));
        }
    }

    #[test]
    fn override_fields_distinguish_subject_and_namespace() {
        assert_eq!(override_field("ns", Some("app")), "ns:app");
        assert_eq!(override_field("ns", None), "ns");
    }
}
