//! Integration tests for telemetry initialization and span helpers.

use secrecy::SecretString;
use workq::config::{Config, Settings};
use workq::queue::QueueState;
use workq::telemetry::delivery::{record_outcome, start_delivery_span};
use workq::telemetry::{TelemetryConfig, init_telemetry, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "workq-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn telemetry_config_follows_loaded_config() {
    let config = Config {
        database_url: SecretString::from("postgres://localhost/test"),
        otel_endpoint: Some("http://localhost:4317".to_string()),
        log_level: "workq=debug".to_string(),
        settings: Settings::default(),
    };
    let telemetry = TelemetryConfig::from_config(&config, "workq-consumer");
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(telemetry.service_name, "workq-consumer");
    assert_eq!(telemetry.log_level, "workq=debug");
}

#[test]
fn queue_state_gauges_report_last_update() {
    let gauges = metrics::QueueStateGauges::register("jobs");
    assert_eq!(gauges.current(), QueueState::default());

    let state = QueueState {
        depth: 4,
        ready: 3,
        unacked: 2,
        orphaned: 1,
    };
    gauges.update(state);
    assert_eq!(gauges.current(), state);
}

#[test]
fn delivery_span_creates_and_records_outcome() {
    let span = start_delivery_span("jobs", "0d6c4c8e-5a43-4a57-9a51-1f8c3b0a7e11", 2);
    record_outcome(&span, "acked");
}

#[test]
fn instruments_record_without_a_provider() {
    metrics::queue_operations().add(1, &[]);
    metrics::messages_dead_lettered().add(1, &[]);
    metrics::rate_limit_decisions().add(1, &[]);
    metrics::capacity_adjustments().add(1, &[]);
    metrics::operation_duration_ms().record(1.5, &[]);
}
