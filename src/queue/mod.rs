//! Durable work queue over a [`KeyValueBackend`].
//!
//! Per queue name `Q` the store holds:
//!
//! - `Q.queue`: ready set, score = epoch millis the message becomes due
//! - `Q.unacked`: leased set, score = ack deadline
//! - `Q.messages`: id -> serialized [`Message`]
//! - `Q.attempts`: id -> delivery count
//! - `Q.locks:<id>`: lease lock, value = holder identity, expires after `lock_ttl`
//!
//! Delivery is at-least-once. The lease lock is the only mutual exclusion
//! between pollers; a worker that outlives its ack deadline may see its
//! message delivered again elsewhere.

pub mod dead_letter;
pub mod event;
pub mod message;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::backend::{KeyValueBackend, Op};
use crate::clock::{Clock, millis};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::telemetry::metrics;

pub use dead_letter::{BackendDeadLetterSink, DeadLetterRecord, DeadLetterSink};
pub use event::QueueEvent;
pub use message::{Message, NewMessage, QueueState, RetrySummary};

/// Storage keys for one queue.
#[derive(Debug, Clone)]
struct Keys {
    name: String,
    ready: String,
    unacked: String,
    messages: String,
    attempts: String,
    fingerprints: String,
}

impl Keys {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ready: format!("{name}.queue"),
            unacked: format!("{name}.unacked"),
            messages: format!("{name}.messages"),
            attempts: format!("{name}.attempts"),
            fingerprints: format!("{name}.fingerprints"),
        }
    }

    fn lock(&self, id: &str) -> String {
        format!("{}.locks:{id}", self.name)
    }

    /// Every write needed to erase a message from the queue.
    fn remove_all(&self, id: &str, fingerprint: Option<&str>) -> Vec<Op> {
        let mut ops = vec![
            Op::zrem(&self.ready, id),
            Op::zrem(&self.unacked, id),
            Op::hdel(&self.messages, id),
            Op::hdel(&self.attempts, id),
            Op::del(self.lock(id)),
        ];
        if let Some(fingerprint) = fingerprint {
            ops.push(Op::hdel_if_eq(&self.fingerprints, fingerprint, id));
        }
        ops
    }
}

enum LockOutcome {
    Acquired,
    AlreadyHeld,
    Busy,
}

/// Handle that completes a delivered message.
///
/// Acking is the only way a message durably leaves the queue. Acking a
/// message that is already gone is a no-op.
#[derive(Clone)]
pub struct Ack {
    backend: Arc<dyn KeyValueBackend>,
    events: broadcast::Sender<QueueEvent>,
    keys: Keys,
    id: String,
    fingerprint: Option<String>,
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack")
            .field("keys", &self.keys)
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Ack {
    pub fn message_id(&self) -> &str {
        &self.id
    }

    pub async fn ack(self) -> Result<()> {
        ack_message(
            self.backend.as_ref(),
            &self.events,
            &self.keys,
            &self.id,
            self.fingerprint.as_deref(),
        )
        .await
    }
}

async fn ack_message(
    backend: &dyn KeyValueBackend,
    events: &broadcast::Sender<QueueEvent>,
    keys: &Keys,
    id: &str,
    fingerprint: Option<&str>,
) -> Result<()> {
    // A lease that lapsed may already be back in the ready set, so the
    // ack clears both sets along with the lock.
    backend.exec(keys.remove_all(id, fingerprint)).await?;
    record_op(&keys.name, "ack");
    events.send(QueueEvent::Acked { id: id.to_string() }).ok();
    Ok(())
}

fn record_op(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// A leased message, its delivery count, and the handle to ack it.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    pub attempts: i64,
    pub ack: Ack,
}

/// The work queue. Cheap to clone; clones share the backend and the event
/// channel.
#[derive(Clone)]
pub struct WorkQueue {
    backend: Arc<dyn KeyValueBackend>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    keys: Keys,
    identity: String,
    dead_letters: Vec<Arc<dyn DeadLetterSink>>,
    events: broadcast::Sender<QueueEvent>,
}

impl WorkQueue {
    /// `identity` names this poller in lease locks. Concurrent pollers must
    /// use distinct identities.
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
        identity: impl Into<String>,
    ) -> Self {
        let keys = Keys::new(&config.name);
        let (events, _) = broadcast::channel(event::EVENT_CAPACITY);
        Self {
            backend,
            clock,
            config,
            keys,
            identity: identity.into(),
            dead_letters: Vec::new(),
            events,
        }
    }

    /// Add a sink that receives messages that ran out of retries.
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters.push(sink);
        self
    }

    /// Same queue and sinks, polling under another identity.
    pub fn with_identity(&self, identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.keys.name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Events from this queue and every clone of it, from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        self.events.send(event).ok();
    }

    fn due_after(&self, delay: Duration) -> i64 {
        self.clock.now_millis().saturating_add(millis(delay))
    }

    // -----------------------------------------------------------------------
    // Producing
    // -----------------------------------------------------------------------

    /// Push a message, due after `delay`. Returns the generated id.
    pub async fn push(&self, message: impl Into<NewMessage>, delay: Duration) -> Result<String> {
        let message = message.into().into_message();
        let body = serde_json::to_string(&message)?;
        let due = self.due_after(delay);

        let mut ops = vec![
            Op::hset(&self.keys.messages, &message.id, body),
            Op::zadd(&self.keys.ready, &message.id, due),
        ];
        if let Some(fingerprint) = &message.fingerprint {
            ops.push(Op::hset(&self.keys.fingerprints, fingerprint, &message.id));
        }
        self.backend.exec(ops).await?;

        record_op(self.name(), "push");
        debug!(queue = %self.name(), id = %message.id, due, "message pushed");
        self.emit(QueueEvent::Pushed {
            id: message.id.clone(),
        });
        Ok(message.id)
    }

    /// Push unless an equivalent message is still waiting or leased.
    ///
    /// Equivalence is by fingerprint: the message's explicit one, else its
    /// payload. Returns the new id, or None if nothing was pushed. Two
    /// concurrent calls may both push; duplicates are possible but rare.
    pub async fn ensure(
        &self,
        message: impl Into<NewMessage>,
        delay: Duration,
    ) -> Result<Option<String>> {
        let mut message = message.into();
        let fingerprint = message.effective_fingerprint();

        if let Some(existing_id) = self
            .backend
            .hget(&self.keys.fingerprints, &fingerprint)
            .await?
            && (self.is_ready(&existing_id).await? || self.is_unacked(&existing_id).await?)
        {
            record_op(self.name(), "ensure_duplicate");
            debug!(queue = %self.name(), %existing_id, "equivalent message already queued");
            self.emit(QueueEvent::Duplicate { existing_id });
            return Ok(None);
        }

        message.fingerprint = Some(fingerprint);
        self.push(message, delay).await.map(Some)
    }

    /// Move a waiting message to a new delivery time. Returns false if the
    /// message is not in the ready set (leased, acked, or unknown).
    pub async fn reschedule(&self, id: &str, delay: Duration) -> Result<bool> {
        let moved = self
            .backend
            .exec(vec![
                Op::require_member(&self.keys.ready, id),
                Op::zadd(&self.keys.ready, id, self.due_after(delay)),
            ])
            .await?;
        if moved {
            record_op(self.name(), "reschedule");
        }
        Ok(moved)
    }

    // -----------------------------------------------------------------------
    // Consuming
    // -----------------------------------------------------------------------

    /// Try once to lease and deliver one due message to `callback`.
    ///
    /// Returns whether a message was delivered. Never waits for work; callers
    /// loop with their own backoff.
    pub async fn poll<F, Fut>(&self, callback: F) -> Result<bool>
    where
        F: FnOnce(Message, Ack) -> Fut,
        Fut: Future<Output = ()>,
    {
        match self.poll_delivery().await? {
            Some(delivery) => {
                callback(delivery.message, delivery.ack).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Lease the earliest due message, if any.
    pub async fn poll_delivery(&self) -> Result<Option<Delivery>> {
        Ok(self.poll_many(1).await?.pop())
    }

    /// Lease up to `max` due messages, earliest first. Candidates leased
    /// elsewhere are skipped, so fewer than `max` may come back even when
    /// more are due.
    pub async fn poll_many(&self, max: usize) -> Result<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let now = self.clock.now_millis();

        let candidates = self
            .backend
            .zrange_by_score(&self.keys.ready, i64::MIN, now, Some(max))
            .await?;

        let mut deliveries = Vec::with_capacity(candidates.len());
        for (id, _) in candidates {
            if let Some(delivery) = self.lease(id, now).await? {
                deliveries.push(delivery);
            }
        }

        record_op(
            self.name(),
            if deliveries.is_empty() { "poll_empty" } else { "poll" },
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "queue.poll")],
        );
        self.emit(QueueEvent::Polled {
            delivered: deliveries.len(),
        });
        Ok(deliveries)
    }

    /// Lease one candidate: lock it, then move it from ready to unacked in a
    /// batch that only applies while it is still ready.
    async fn lease(&self, id: String, now: i64) -> Result<Option<Delivery>> {
        let lock = self.keys.lock(&id);
        let outcome = self.acquire_lock(&lock).await?;
        if matches!(outcome, LockOutcome::Busy) {
            debug!(queue = %self.name(), %id, "candidate leased elsewhere");
            record_op(self.name(), "poll_contended");
            self.emit(QueueEvent::LockFailed { id });
            return Ok(None);
        }

        let deadline = now.saturating_add(millis(self.config.ack_timeout));
        let moved = self
            .backend
            .exec(vec![
                Op::require_member(&self.keys.ready, &id),
                Op::expire(&lock, self.config.lock_ttl),
                Op::zrem(&self.keys.ready, &id),
                Op::zadd(&self.keys.unacked, &id, deadline),
                Op::hincr(&self.keys.attempts, &id, 1),
            ])
            .await?;
        if !moved {
            // Acked, or leased and acked by someone else, since the range read.
            if matches!(outcome, LockOutcome::Acquired) {
                self.backend.del(&lock).await?;
            }
            record_op(self.name(), "poll_contended");
            return Ok(None);
        }

        let Some(message) = self.read_message(&id).await? else {
            self.purge(&id, &self.keys.unacked).await?;
            return Ok(None);
        };
        let attempts = self.attempts(&id).await?;

        Ok(Some(Delivery {
            attempts,
            ack: Ack {
                backend: Arc::clone(&self.backend),
                events: self.events.clone(),
                keys: self.keys.clone(),
                id,
                fingerprint: message.fingerprint.clone(),
            },
            message,
        }))
    }

    /// Ack by id, for callers that kept the id rather than the handle.
    pub async fn ack(&self, id: &str) -> Result<()> {
        let fingerprint = match self.backend.hget(&self.keys.messages, id).await? {
            Some(body) => serde_json::from_str::<Message>(&body)
                .ok()
                .and_then(|m| m.fingerprint),
            None => None,
        };
        ack_message(
            self.backend.as_ref(),
            &self.events,
            &self.keys,
            id,
            fingerprint.as_deref(),
        )
        .await
    }

    async fn acquire_lock(&self, lock: &str) -> Result<LockOutcome> {
        if self
            .backend
            .set_nx(lock, &self.identity, Some(self.config.lock_ttl))
            .await?
        {
            return Ok(LockOutcome::Acquired);
        }
        match self.backend.get(lock).await? {
            Some(holder) if holder == self.identity => Ok(LockOutcome::AlreadyHeld),
            _ => Ok(LockOutcome::Busy),
        }
    }

    /// Body for `id`, or None if it is missing or unreadable.
    async fn read_message(&self, id: &str) -> Result<Option<Message>> {
        let Some(body) = self.backend.hget(&self.keys.messages, id).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Message>(&body) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                error!(queue = %self.name(), %id, %e, "message body unreadable");
                Ok(None)
            }
        }
    }

    /// Erase a message that can never be delivered, provided it is still in
    /// `set`. Returns false if it left `set` first, meaning a concurrent ack
    /// removed it and there is nothing to purge.
    async fn purge(&self, id: &str, set: &str) -> Result<bool> {
        let mut ops = vec![Op::require_member(set, id)];
        ops.extend(self.keys.remove_all(id, None));
        if !self.backend.exec(ops).await? {
            return Ok(false);
        }
        record_op(self.name(), "purge");
        error!(queue = %self.name(), %id, "purged message with missing or unreadable body");
        self.emit(QueueEvent::Purged { id: id.to_string() });
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Reclaim messages whose ack deadline has passed.
    ///
    /// Each lapsed message either goes back to the ready set due immediately
    /// or, once its delivery budget is spent, goes to the dead-letter sinks
    /// and is removed. Every move is conditional on the message still being
    /// unacked, so a worker that acks during the sweep wins.
    pub async fn retry(&self) -> Result<RetrySummary> {
        let now = self.clock.now_millis();
        let lapsed = self
            .backend
            .zrange_by_score(&self.keys.unacked, i64::MIN, now - 1, None)
            .await?;

        let mut summary = RetrySummary::default();
        for (id, _) in lapsed {
            let Some(message) = self.read_message(&id).await? else {
                if self.purge(&id, &self.keys.unacked).await? {
                    summary.purged += 1;
                }
                continue;
            };

            let attempts = self.attempts(&id).await?;
            let limit = i64::from(message.max_attempts.unwrap_or(self.config.max_retries));

            if attempts >= limit {
                if self.dead_letter(&message, attempts, now).await? {
                    warn!(queue = %self.name(), %id, attempts, limit, "retries exhausted, dead-lettered");
                    summary.dead_lettered += 1;
                }
                continue;
            }

            let requeued = self
                .backend
                .exec(vec![
                    Op::require_member(&self.keys.unacked, &id),
                    Op::zrem(&self.keys.unacked, &id),
                    Op::zadd(&self.keys.ready, &id, now),
                    Op::del(self.keys.lock(&id)),
                ])
                .await?;
            if requeued {
                record_op(self.name(), "requeue");
                debug!(queue = %self.name(), %id, attempts, "lease lapsed, requeued");
                self.emit(QueueEvent::Retried { id, attempts });
                summary.requeued += 1;
            }
        }
        Ok(summary)
    }

    /// Claim a lapsed message out of the unacked set, hand it to every sink,
    /// then erase it. Returns false if it was acked before the claim.
    ///
    /// If a sink fails the message goes back to the unacked set, due for the
    /// next sweep, and the error propagates.
    async fn dead_letter(&self, message: &Message, attempts: i64, now: i64) -> Result<bool> {
        let id = &message.id;
        let claimed = self
            .backend
            .exec(vec![
                Op::require_member(&self.keys.unacked, id),
                Op::zrem(&self.keys.unacked, id),
                Op::del(self.keys.lock(id)),
            ])
            .await?;
        if !claimed {
            return Ok(false);
        }

        for sink in &self.dead_letters {
            if let Err(e) = sink.handle(self.name(), message).await {
                self.backend
                    .exec(vec![
                        Op::require_field(&self.keys.messages, id),
                        Op::zadd(&self.keys.unacked, id, now),
                    ])
                    .await?;
                return Err(e);
            }
        }

        self.backend
            .exec(self.keys.remove_all(id, message.fingerprint.as_deref()))
            .await?;
        metrics::messages_dead_lettered().add(1, &[KeyValue::new("queue", self.name().to_string())]);
        self.emit(QueueEvent::DeadLettered {
            id: id.clone(),
            attempts,
        });
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Messages in the ready set, due or not.
    pub async fn queue_depth(&self) -> Result<u64> {
        self.backend.zcard(&self.keys.ready).await
    }

    pub async fn unacked_depth(&self) -> Result<u64> {
        self.backend.zcard(&self.keys.unacked).await
    }

    /// Ready messages whose delivery time has arrived.
    pub async fn ready_depth(&self) -> Result<u64> {
        self.backend
            .zcount(&self.keys.ready, i64::MIN, self.clock.now_millis())
            .await
    }

    /// Bodies with no id in either set. Non-zero means a partial failure
    /// somewhere; this is reported, not repaired.
    pub async fn orphan_count(&self) -> Result<u64> {
        let bodies = self.backend.hgetall(&self.keys.messages).await?;
        if bodies.is_empty() {
            return Ok(0);
        }
        let mut live: HashSet<String> = HashSet::new();
        for key in [&self.keys.ready, &self.keys.unacked] {
            let members = self
                .backend
                .zrange_by_score(key, i64::MIN, i64::MAX, None)
                .await?;
            live.extend(members.into_iter().map(|(m, _)| m));
        }
        Ok(bodies.keys().filter(|id| !live.contains(*id)).count() as u64)
    }

    pub async fn read_state(&self) -> Result<QueueState> {
        Ok(QueueState {
            depth: self.queue_depth().await?,
            ready: self.ready_depth().await?,
            unacked: self.unacked_depth().await?,
            orphaned: self.orphan_count().await?,
        })
    }

    /// Delivery count for a message; 0 if never delivered or gone.
    pub async fn attempts(&self, id: &str) -> Result<i64> {
        Ok(self
            .backend
            .hget(&self.keys.attempts, id)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Whether any stored message matches `predicate`. Unreadable bodies
    /// are logged and skipped.
    pub async fn contains_message<P>(&self, predicate: P) -> Result<bool>
    where
        P: Fn(&Message) -> bool,
    {
        let bodies = self.backend.hgetall(&self.keys.messages).await?;
        for (id, body) in bodies {
            match serde_json::from_str::<Message>(&body) {
                Ok(message) if predicate(&message) => return Ok(true),
                Ok(_) => {}
                Err(e) => error!(queue = %self.name(), %id, %e, "message body unreadable"),
            }
        }
        Ok(false)
    }

    /// Whether `id` is in the ready set.
    pub async fn is_ready(&self, id: &str) -> Result<bool> {
        Ok(self.backend.zscore(&self.keys.ready, id).await?.is_some())
    }

    /// Whether `id` is leased and awaiting ack.
    pub async fn is_unacked(&self, id: &str) -> Result<bool> {
        Ok(self.backend.zscore(&self.keys.unacked, id).await?.is_some())
    }
}
