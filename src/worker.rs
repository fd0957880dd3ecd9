//! Worker loop: poll the queue, hand messages to a handler, ack on success.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::queue::{Message, WorkQueue};
use crate::telemetry::delivery::{record_outcome, start_delivery_span};
use crate::telemetry::metrics;

/// Processes one message. Returning an error leaves the message unacked;
/// the retry sweep redelivers it once the ack deadline passes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Shared stop signal for any number of loops.
#[derive(Debug, Default)]
pub struct Shutdown {
    stopping: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trigger(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::trigger`] has been called.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// One polling loop. Run several, each with its own queue identity, for
/// concurrency.
pub struct QueueWorker {
    queue: WorkQueue,
    handler: Arc<dyn MessageHandler>,
    config: WorkerConfig,
    shutdown: Arc<Shutdown>,
}

impl QueueWorker {
    pub fn new(
        queue: WorkQueue,
        handler: Arc<dyn MessageHandler>,
        config: WorkerConfig,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            shutdown,
        }
    }

    /// Poll until shutdown. Backend errors are logged and the loop backs off
    /// for one poll interval, then tries again.
    pub async fn run(&self) -> Result<()> {
        info!(queue = %self.queue.name(), identity = %self.queue.identity(), "worker started");

        while !self.shutdown.is_triggered() {
            let delivered = match self.process_one().await {
                Ok(delivered) => delivered,
                Err(e) => {
                    error!(queue = %self.queue.name(), "poll failed: {e}");
                    false
                }
            };
            if delivered {
                continue;
            }
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(queue = %self.queue.name(), identity = %self.queue.identity(), "worker stopped");
        Ok(())
    }

    /// Lease and process at most one message. Returns whether one was found.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(delivery) = self.queue.poll_delivery().await? else {
            return Ok(false);
        };

        let span = start_delivery_span(self.queue.name(), &delivery.message.id, delivery.attempts);
        let started = Instant::now();

        let result = self
            .handler
            .handle(&delivery.message)
            .instrument(span.clone())
            .await;

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "queue.handle")],
        );

        match result {
            Ok(()) => {
                delivery.ack.ack().await?;
                record_outcome(&span, "acked");
            }
            Err(e) => {
                record_outcome(&span, "failed");
                warn!(
                    queue = %self.queue.name(),
                    id = %delivery.message.id,
                    attempts = delivery.attempts,
                    "handler failed, leaving for redelivery: {e}"
                );
            }
        }
        Ok(true)
    }
}
