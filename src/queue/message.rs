//! Queue message types.
//!
//! A message is an id plus an opaque JSON payload. The queue never looks
//! inside the payload; producers and consumers agree on its shape.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message as stored in the queue and handed to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, assigned at push time.
    pub id: String,

    /// Opaque payload.
    pub payload: serde_json::Value,

    /// Per-message delivery budget. None = use the queue's `max_retries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Deduplication key. Set for messages pushed with a fingerprint or
    /// through `ensure`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Message {
    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Input for pushing a message. The id is generated by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
    pub fingerprint: Option<String>,
}

impl NewMessage {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            max_attempts: None,
            fingerprint: None,
        }
    }

    /// Serialize any payload type.
    pub fn from_payload<T: Serialize>(payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Key under which `ensure` recognizes equivalent messages.
    pub fn fingerprint(mut self, key: impl Into<String>) -> Self {
        self.fingerprint = Some(key.into());
        self
    }

    /// The explicit fingerprint, else the payload's JSON text. Object keys
    /// serialize sorted, so equal payloads give equal fingerprints.
    pub(crate) fn effective_fingerprint(&self) -> String {
        self.fingerprint
            .clone()
            .unwrap_or_else(|| self.payload.to_string())
    }

    pub(crate) fn into_message(self) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            payload: self.payload,
            max_attempts: self.max_attempts,
            fingerprint: self.fingerprint,
        }
    }
}

impl From<serde_json::Value> for NewMessage {
    fn from(payload: serde_json::Value) -> Self {
        Self::new(payload)
    }
}

/// Counts across a queue's structures at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueState {
    /// Messages waiting in the ready set, due or not.
    pub depth: u64,
    /// Ready messages whose delivery time has arrived.
    pub ready: u64,
    /// Messages leased to a worker and awaiting ack.
    pub unacked: u64,
    /// Stored bodies referenced by neither set.
    pub orphaned: u64,
}

/// What one `retry` sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetrySummary {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub purged: usize,
}
