//! Dead-letter handling for messages that exhausted their retries.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use super::message::Message;
use crate::backend::KeyValueBackend;
use crate::clock::Clock;
use crate::error::Result;

/// Receives messages the queue has given up on.
///
/// Called from the retry sweep before the message is removed from the
/// queue, so an error here leaves the message in place for the next sweep.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn handle(&self, queue: &str, message: &Message) -> Result<()>;
}

/// A dead message and when it died.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterRecord {
    pub message: Message,
    /// Epoch millis.
    pub dead_at: i64,
}

/// Time-ordered dead-letter store in the shared backend.
///
/// One sorted set per sink name: score = time of death, member = the
/// serialized message. Append-only.
#[derive(Clone)]
pub struct BackendDeadLetterSink {
    backend: Arc<dyn KeyValueBackend>,
    clock: Arc<dyn Clock>,
    name: String,
}

impl BackendDeadLetterSink {
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        clock: Arc<dyn Clock>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            clock,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn len(&self) -> Result<u64> {
        self.backend.zcard(&self.name).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Oldest-first records, at most `limit`.
    pub async fn records(&self, limit: Option<usize>) -> Result<Vec<DeadLetterRecord>> {
        let entries = self
            .backend
            .zrange_by_score(&self.name, i64::MIN, i64::MAX, limit)
            .await?;
        let mut records = Vec::with_capacity(entries.len());
        for (body, dead_at) in entries {
            match serde_json::from_str::<Message>(&body) {
                Ok(message) => records.push(DeadLetterRecord { message, dead_at }),
                Err(e) => error!(sink = %self.name, %e, "unreadable dead-letter entry"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DeadLetterSink for BackendDeadLetterSink {
    async fn handle(&self, queue: &str, message: &Message) -> Result<()> {
        let body = serde_json::to_string(message)?;
        self.backend
            .zadd(&self.name, &body, self.clock.now_millis())
            .await?;
        info!(queue, sink = %self.name, id = %message.id, "message dead-lettered");
        Ok(())
    }
}
