//! Shared key-value store primitives.
//!
//! Everything above this layer coordinates only through these operations:
//! score-ordered sets, field maps, plain sets, expiring keys, and atomic
//! batches. Scores are epoch milliseconds.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::InMemoryBackend;
pub use postgres::PgBackend;

/// A single step of an atomic batch.
///
/// `Require*` steps are preconditions. They are checked against the store
/// as it was before the batch; if any fails, nothing in the batch is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// `member` is in the sorted set `key`.
    RequireMember {
        key: String,
        member: String,
    },
    /// `field` is present in the map `key`.
    RequireField {
        key: String,
        field: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: i64,
    },
    ZRem {
        key: String,
        member: String,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
    HDel {
        key: String,
        field: String,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    /// Delete `field` only while it still holds `value`.
    HDelIfEq {
        key: String,
        field: String,
        value: String,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
}

impl Op {
    pub fn require_member(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::RequireMember {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn require_field(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self::RequireField {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn zadd(key: impl Into<String>, member: impl Into<String>, score: i64) -> Self {
        Self::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        }
    }

    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::ZRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hdel(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self::HDel {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn hincr(key: impl Into<String>, field: impl Into<String>, delta: i64) -> Self {
        Self::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        }
    }

    pub fn hdel_if_eq(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::HDelIfEq {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn expire(key: impl Into<String>, ttl: Duration) -> Self {
        Self::Expire {
            key: key.into(),
            ttl,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }
}

/// Backend trait for the shared store.
///
/// Implementations must make each method atomic on its own and must apply
/// a batch passed to [`KeyValueBackend::exec`] all-or-nothing.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    // --- sorted sets ---

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Returns true if the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>>;

    /// Members with `min <= score <= max`, ascending by score, at most `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64>;

    // --- field maps ---

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Increment a numeric field, creating it at zero. Returns the new value.
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Returns true if the field was present.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hlen(&self, key: &str) -> Result<u64>;

    // --- plain sets ---

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    // --- expiring keys ---

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set only if the key is absent (or expired). Returns true if written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Increment a numeric key, creating it at zero. Returns the new value.
    /// An existing expiry is kept.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    /// Returns true if the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<bool>;

    // --- batches ---

    /// Apply all operations atomically. Returns false, with nothing
    /// applied, if a precondition in the batch does not hold.
    async fn exec(&self, ops: Vec<Op>) -> Result<bool>;
}
