//! Message delivery span helpers.
//!
//! Provides span creation and outcome recording for messages flowing
//! through a worker.

use tracing::Span;

/// Start a span for one delivery of a message.
///
/// The `delivery.outcome` field is declared empty and can be filled via
/// [`record_outcome`].
pub fn start_delivery_span(queue: &str, message_id: &str, attempts: i64) -> Span {
    tracing::info_span!(
        "queue.deliver",
        "queue.name" = queue,
        "message.id" = message_id,
        "message.attempts" = attempts,
        "delivery.outcome" = tracing::field::Empty,
    )
}

/// Record how a delivery ended ("acked", "failed", ...).
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("delivery.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome = outcome, "delivery finished");
    });
}
