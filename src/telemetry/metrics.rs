//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter.

use std::sync::{Arc, RwLock};

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter, ObservableGauge};

use crate::queue::QueueState;

/// Returns the shared meter for workq instruments.
pub fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: queue-level operations (push, poll, ack, requeue, purge).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: messages handed to the dead-letter sinks.
/// Labels: `queue`.
pub fn messages_dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.dead_lettered")
        .with_description("Messages that exhausted their retries")
        .build()
}

/// Counter: rate limiter decisions.
/// Labels: `namespace`, `limited`, `enforced`.
pub fn rate_limit_decisions() -> Counter<u64> {
    meter()
        .u64_counter("workq.ratelimit.decisions")
        .with_description("Rate limiter decisions")
        .build()
}

/// Counter: capacity usage adjustments.
/// Labels: `priority`, `direction` ("increment" | "decrement").
pub fn capacity_adjustments() -> Counter<u64> {
    meter()
        .u64_counter("workq.capacity.adjustments")
        .with_description("Priority capacity usage adjustments")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Observable gauges for one queue's [`QueueState`].
///
/// The callbacks report the last state passed to [`Self::update`]; the
/// maintenance loop refreshes it on the gauge interval.
pub struct QueueStateGauges {
    state: Arc<RwLock<QueueState>>,
    _gauges: Vec<ObservableGauge<u64>>,
}

impl QueueStateGauges {
    /// Gauges: `workq.queue.depth`, `.ready`, `.unacked`, `.orphaned`.
    /// Labels: `queue`.
    pub fn register(queue: &str) -> Self {
        let state = Arc::new(RwLock::new(QueueState::default()));
        let fields: [(&'static str, &'static str, fn(&QueueState) -> u64); 4] = [
            ("workq.queue.depth", "Messages in the ready set", |s| s.depth),
            ("workq.queue.ready", "Ready messages that are due", |s| s.ready),
            ("workq.queue.unacked", "Leased messages awaiting ack", |s| s.unacked),
            ("workq.queue.orphaned", "Bodies in neither set", |s| s.orphaned),
        ];
        let gauges = fields
            .into_iter()
            .map(|(name, description, read)| {
                let state = Arc::clone(&state);
                let labels = [KeyValue::new("queue", queue.to_string())];
                meter()
                    .u64_observable_gauge(name)
                    .with_description(description)
                    .with_callback(move |observer| {
                        if let Ok(s) = state.read() {
                            observer.observe(read(&s), &labels);
                        }
                    })
                    .build()
            })
            .collect();
        Self {
            state,
            _gauges: gauges,
        }
    }

    pub fn update(&self, state: QueueState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    /// The state the gauges currently report.
    pub fn current(&self) -> QueueState {
        self.state.read().map(|s| *s).unwrap_or_default()
    }
}
