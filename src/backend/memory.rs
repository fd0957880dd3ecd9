//! In-process backend for tests and single-process deployments.
//!
//! Every method takes one mutex, so each call and each batch is atomic with
//! respect to every other caller sharing the same `Arc<InMemoryBackend>`.
//! Key expiry is evaluated lazily against the injected [`Clock`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{KeyValueBackend, Op};
use crate::clock::{Clock, SystemClock, millis};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<i64>,
}

impl Entry {
    fn live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    sorted: HashMap<String, HashMap<String, i64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    strings: HashMap<String, Entry>,
}

impl State {
    fn live_entry(&mut self, key: &str, now: i64) -> Option<&mut Entry> {
        if self.strings.get(key).is_some_and(|e| !e.live(now)) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }

    fn hincr(&mut self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let map = self.hashes.entry(key.to_string()).or_default();
        let current = match map.get(field) {
            Some(v) => parse_int(v)?,
            None => 0,
        };
        let next = current + delta;
        map.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    /// Whether a precondition step holds. Writes always hold.
    fn holds(&self, op: &Op) -> bool {
        match op {
            Op::RequireMember { key, member } => {
                self.sorted.get(key).is_some_and(|s| s.contains_key(member))
            }
            Op::RequireField { key, field } => {
                self.hashes.get(key).is_some_and(|m| m.contains_key(field))
            }
            _ => true,
        }
    }

    /// Replay the map writes of a batch on a scratch overlay so a bad
    /// increment is caught before anything is written, including one whose
    /// field an earlier step of the same batch overwrote.
    fn check_increments(&self, ops: &[Op]) -> Result<()> {
        let mut scratch: HashMap<(&str, &str), Option<String>> = HashMap::new();
        for op in ops {
            match op {
                Op::HSet { key, field, value } => {
                    scratch.insert((key.as_str(), field.as_str()), Some(value.clone()));
                }
                Op::HDel { key, field } => {
                    scratch.insert((key.as_str(), field.as_str()), None);
                }
                Op::HDelIfEq { key, field, value } => {
                    if self.scratch_value(&scratch, key, field).as_deref() == Some(value.as_str()) {
                        scratch.insert((key.as_str(), field.as_str()), None);
                    }
                }
                Op::HIncrBy { key, field, delta } => {
                    let base = match self.scratch_value(&scratch, key, field) {
                        Some(v) => parse_int(&v)?,
                        None => 0,
                    };
                    scratch.insert((key.as_str(), field.as_str()), Some((base + delta).to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn scratch_value<'a>(
        &self,
        scratch: &HashMap<(&'a str, &'a str), Option<String>>,
        key: &'a str,
        field: &'a str,
    ) -> Option<String> {
        match scratch.get(&(key, field)) {
            Some(v) => v.clone(),
            None => self.hashes.get(key).and_then(|m| m.get(field)).cloned(),
        }
    }

    fn apply(&mut self, op: Op, now: i64) -> Result<()> {
        match op {
            Op::RequireMember { .. } | Op::RequireField { .. } => {}
            Op::ZAdd { key, member, score } => {
                self.sorted.entry(key).or_default().insert(member, score);
            }
            Op::ZRem { key, member } => {
                if let Some(set) = self.sorted.get_mut(&key) {
                    set.remove(&member);
                }
            }
            Op::HSet { key, field, value } => {
                self.hashes.entry(key).or_default().insert(field, value);
            }
            Op::HDel { key, field } => {
                if let Some(map) = self.hashes.get_mut(&key) {
                    map.remove(&field);
                }
            }
            Op::HIncrBy { key, field, delta } => {
                self.hincr(&key, &field, delta)?;
            }
            Op::HDelIfEq { key, field, value } => {
                if let Some(map) = self.hashes.get_mut(&key)
                    && map.get(&field) == Some(&value)
                {
                    map.remove(&field);
                }
            }
            Op::Set { key, value, ttl } => {
                let expires_at = ttl.map(|t| now.saturating_add(millis(t)));
                self.strings.insert(key, Entry { value, expires_at });
            }
            Op::Expire { key, ttl } => {
                if let Some(entry) = self.live_entry(&key, now) {
                    entry.expires_at = Some(now.saturating_add(millis(ttl)));
                }
            }
            Op::Del { key } => {
                self.strings.remove(&key);
            }
        }
        Ok(())
    }
}

fn parse_int(v: &str) -> Result<i64> {
    v.parse()
        .map_err(|_| Error::Other(format!("value is not an integer: {v}")))
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Unavailable("in-memory backend lock poisoned".to_string())
}

/// Process-local [`KeyValueBackend`].
pub struct InMemoryBackend {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl InMemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails with [`Error::Unavailable`]
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("backend marked unavailable".to_string()));
        }
        self.state.lock().map_err(poisoned)
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryBackend {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut state = self.lock()?;
        state
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state
            .sorted
            .get_mut(key)
            .is_some_and(|set| set.remove(member).is_some()))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let state = self.lock()?;
        Ok(state.sorted.get(key).and_then(|set| set.get(member).copied()))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>> {
        let state = self.lock()?;
        let Some(set) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(String, i64)> = set
            .iter()
            .filter(|(_, score)| (min..=max).contains(*score))
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        hits.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let state = self.lock()?;
        Ok(state.sorted.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64> {
        let state = self.lock()?;
        Ok(state.sorted.get(key).map_or(0, |set| {
            set.values().filter(|s| (min..=max).contains(*s)).count() as u64
        }))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.lock()?;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(key).and_then(|m| m.get(field).cloned()))
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.lock()?.hincr(key, field, delta)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state
            .hashes
            .get_mut(key)
            .is_some_and(|m| m.remove(field).is_some()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let state = self.lock()?;
        Ok(state.hashes.get(key).map_or(0, |m| m.len() as u64))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.lock()?;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state.sets.get_mut(key).is_some_and(|s| s.remove(member)))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now();
        let mut state = self.lock()?;
        Ok(state.live_entry(key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = self.now();
        self.lock()?.apply(
            Op::Set {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            },
            now,
        )
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = self.now();
        let mut state = self.lock()?;
        if state.live_entry(key, now).is_some() {
            return Ok(false);
        }
        state.apply(
            Op::Set {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            },
            now,
        )?;
        Ok(true)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let now = self.now();
        let mut state = self.lock()?;
        if let Some(entry) = state.live_entry(key, now) {
            let next = parse_int(&entry.value)? + delta;
            entry.value = next.to_string();
            return Ok(next);
        }
        state.strings.insert(
            key.to_string(),
            Entry {
                value: delta.to_string(),
                expires_at: None,
            },
        );
        Ok(delta)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.now();
        let mut state = self.lock()?;
        match state.live_entry(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now.saturating_add(millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = self.now();
        let mut state = self.lock()?;
        let existed = state.live_entry(key, now).is_some();
        state.strings.remove(key);
        Ok(existed)
    }

    async fn exec(&self, ops: Vec<Op>) -> Result<bool> {
        let now = self.now();
        let mut state = self.lock()?;
        if !ops.iter().all(|op| state.holds(op)) {
            return Ok(false);
        }
        state.check_increments(&ops)?;
        for op in ops {
            state.apply(op, now)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn backend() -> (Arc<ManualClock>, InMemoryBackend) {
        let clock = Arc::new(ManualClock::new(1_000));
        let backend = InMemoryBackend::new(clock.clone());
        (clock, backend)
    }

    #[tokio::test]
    async fn set_nx_respects_expiry() {
        let (clock, backend) = backend();
        assert!(
            backend
                .set_nx("lock", "a", Some(Duration::from_secs(1)))
                .await
                .unwrap()
        );
        assert!(!backend.set_nx("lock", "b", None).await.unwrap());

        clock.advance(Duration::from_millis(1_001));
        assert!(backend.set_nx("lock", "b", None).await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn range_is_ordered_by_score_then_member() {
        let (_, backend) = backend();
        backend.zadd("z", "c", 5).await.unwrap();
        backend.zadd("z", "b", 1).await.unwrap();
        backend.zadd("z", "a", 5).await.unwrap();

        let all = backend.zrange_by_score("z", 0, 10, None).await.unwrap();
        let members: Vec<_> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, ["b", "a", "c"]);

        let first = backend.zrange_by_score("z", 0, 10, Some(1)).await.unwrap();
        assert_eq!(first, vec![("b".to_string(), 1)]);
        assert_eq!(backend.zcount("z", 2, 10).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn incr_restarts_after_expiry() {
        let (clock, backend) = backend();
        assert_eq!(backend.incr("n", 1).await.unwrap(), 1);
        assert!(backend.expire("n", Duration::from_millis(10)).await.unwrap());
        assert_eq!(backend.incr("n", 1).await.unwrap(), 2);

        clock.advance(Duration::from_millis(10));
        assert_eq!(backend.incr("n", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bad_increment_leaves_batch_unapplied() {
        let (_, backend) = backend();
        backend.hset("h", "f", "not-a-number").await.unwrap();

        let result = backend
            .exec(vec![Op::zadd("z", "m", 1), Op::hincr("h", "f", 1)])
            .await;
        assert!(result.is_err());
        assert_eq!(backend.zcard("z").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn increment_of_field_overwritten_in_batch_leaves_batch_unapplied() {
        let (_, backend) = backend();

        let result = backend
            .exec(vec![
                Op::zadd("z", "m", 1),
                Op::hset("h", "f", "x"),
                Op::hincr("h", "f", 1),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(backend.zcard("z").await.unwrap(), 0);
        assert_eq!(backend.hget("h", "f").await.unwrap(), None);

        // Deleting first makes the increment start from zero.
        backend.hset("h", "g", "x").await.unwrap();
        assert!(
            backend
                .exec(vec![Op::hdel("h", "g"), Op::hincr("h", "g", 2)])
                .await
                .unwrap()
        );
        assert_eq!(backend.hget("h", "g").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn failed_precondition_skips_whole_batch() {
        let (_, backend) = backend();
        backend.zadd("ready", "a", 1).await.unwrap();

        let applied = backend
            .exec(vec![
                Op::require_member("ready", "b"),
                Op::zadd("unacked", "b", 5),
            ])
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(backend.zcard("unacked").await.unwrap(), 0);

        let applied = backend
            .exec(vec![
                Op::require_member("ready", "a"),
                Op::zrem("ready", "a"),
                Op::zadd("unacked", "a", 5),
            ])
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(backend.zscore("unacked", "a").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn field_precondition_and_conditional_delete() {
        let (_, backend) = backend();
        backend.hset("h", "fp", "id-1").await.unwrap();

        assert!(
            !backend
                .exec(vec![Op::require_field("h", "missing"), Op::hset("h", "x", "1")])
                .await
                .unwrap()
        );
        assert_eq!(backend.hget("h", "x").await.unwrap(), None);

        backend
            .exec(vec![Op::hdel_if_eq("h", "fp", "id-2")])
            .await
            .unwrap();
        assert_eq!(backend.hget("h", "fp").await.unwrap().as_deref(), Some("id-1"));
        backend
            .exec(vec![Op::hdel_if_eq("h", "fp", "id-1")])
            .await
            .unwrap();
        assert_eq!(backend.hget("h", "fp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unavailable_backend_fails_every_call() {
        let (_, backend) = backend();
        backend.set_unavailable(true);
        let err = backend.zcard("z").await.unwrap_err();
        assert!(err.is_backend());
    }
}
