//! Lifecycle notifications published by a [`WorkQueue`](super::WorkQueue).
//!
//! Delivery is best effort over a `tokio::sync::broadcast` channel: a
//! subscriber that falls behind sees `RecvError::Lagged` and misses events.
//! Nothing in the queue waits on subscribers.

/// Default number of events buffered per subscriber.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A message was written to the ready set.
    Pushed { id: String },
    /// `ensure` found an equivalent message still queued and pushed nothing.
    Duplicate { existing_id: String },
    /// One poll finished; `delivered` may be zero.
    Polled { delivered: usize },
    /// A due candidate was leased by another poller.
    LockFailed { id: String },
    Acked { id: String },
    /// A lapsed lease went back to the ready set.
    Retried { id: String, attempts: i64 },
    DeadLettered { id: String, attempts: i64 },
    /// A message with a missing or unreadable body was erased.
    Purged { id: String },
}
