//! Active execution tracking against an in-memory execution store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use workq::backend::{InMemoryBackend, KeyValueBackend};
use workq::config::MonitorConfig;
use workq::error::{Error, Result};
use workq::monitor::{
    ActiveExecutionMonitor, ExecutionRepository, ExecutionSummary, InMemoryExecutionRepository,
    LifecycleEvent,
};

fn execution(id: &str, execution_type: &str) -> ExecutionSummary {
    ExecutionSummary {
        id: id.to_string(),
        execution_type: execution_type.to_string(),
        application: "billing".to_string(),
        complete: false,
    }
}

struct Fixture {
    backend: Arc<InMemoryBackend>,
    repository: Arc<InMemoryExecutionRepository>,
    monitor: Arc<ActiveExecutionMonitor>,
}

fn fixture() -> Fixture {
    let backend = Arc::new(InMemoryBackend::default());
    let repository = Arc::new(InMemoryExecutionRepository::new());
    let monitor = Arc::new(ActiveExecutionMonitor::new(
        backend.clone(),
        repository.clone(),
        &MonitorConfig::default(),
    ));
    Fixture {
        backend,
        repository,
        monitor,
    }
}

#[tokio::test]
async fn start_and_complete_track_one_record() {
    let f = fixture();
    f.repository.upsert(execution("e1", "pipeline"));

    f.monitor.on_execution_started("pipeline", "e1").await.unwrap();
    let records = f.monitor.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "e1");
    assert_eq!(records[0].execution_type, "pipeline");
    assert_eq!(records[0].application, "billing");

    f.monitor.on_execution_complete("e1").await.unwrap();
    assert!(f.monitor.records().await.unwrap().is_empty());

    // Completing twice, or something never tracked, is harmless.
    f.monitor.on_execution_complete("e1").await.unwrap();
    f.monitor.on_execution_complete("nope").await.unwrap();
}

#[tokio::test]
async fn unknown_execution_is_not_tracked() {
    let f = fixture();
    f.monitor.on_execution_started("pipeline", "ghost").await.unwrap();
    assert!(f.monitor.records().await.unwrap().is_empty());
}

struct BrokenRepository;

#[async_trait]
impl ExecutionRepository for BrokenRepository {
    async fn retrieve(&self, _: &str, _: &str) -> Result<Option<ExecutionSummary>> {
        Err(Error::Unavailable("execution store down".to_string()))
    }
}

#[tokio::test]
async fn lookup_failure_drops_the_start_event() {
    let backend = Arc::new(InMemoryBackend::default());
    let monitor =
        ActiveExecutionMonitor::new(backend, Arc::new(BrokenRepository), &MonitorConfig::default());

    monitor.on_execution_started("pipeline", "e1").await.unwrap();
    assert!(monitor.records().await.unwrap().is_empty());
}

#[tokio::test]
async fn register_gauges_counts_by_type_and_keeps_zeroes() {
    let f = fixture();
    f.repository.upsert(execution("e1", "pipeline"));
    f.repository.upsert(execution("e2", "pipeline"));
    f.repository.upsert(execution("e3", "task"));
    for (t, id) in [("pipeline", "e1"), ("pipeline", "e2"), ("task", "e3")] {
        f.monitor.on_execution_started(t, id).await.unwrap();
    }

    let counts = f.monitor.register_gauges().await.unwrap();
    assert_eq!(counts.get("pipeline"), Some(&2));
    assert_eq!(counts.get("task"), Some(&1));
    assert_eq!(f.monitor.snapshot(), counts);

    f.monitor.on_execution_complete("e3").await.unwrap();
    let counts = f.monitor.register_gauges().await.unwrap();
    assert_eq!(counts.get("task"), Some(&0));
    assert_eq!(counts.get("pipeline"), Some(&2));
}

#[tokio::test]
async fn cleanup_removes_missing_and_finished_executions() {
    let f = fixture();
    f.repository.upsert(execution("running", "pipeline"));
    f.repository.upsert(execution("finished", "pipeline"));
    f.repository.upsert(execution("vanished", "task"));
    for id in ["running", "finished"] {
        f.monitor.on_execution_started("pipeline", id).await.unwrap();
    }
    f.monitor.on_execution_started("task", "vanished").await.unwrap();

    f.repository.upsert(ExecutionSummary {
        complete: true,
        ..execution("finished", "pipeline")
    });
    f.repository.remove("vanished");

    let summary = f.monitor.cleanup().await.unwrap();
    assert_eq!(summary.checked, 3);
    assert_eq!(summary.removed, 2);

    let records = f.monitor.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "running");
}

#[tokio::test]
async fn cleanup_removes_unreadable_records() {
    let f = fixture();
    f.backend
        .hset("workq.active-executions", "junk", "not a record")
        .await
        .unwrap();

    let summary = f.monitor.cleanup().await.unwrap();
    assert_eq!(summary.removed, 1);
    assert_eq!(f.backend.hlen("workq.active-executions").await.unwrap(), 0);
}

#[tokio::test]
async fn cleanup_keeps_records_when_lookup_fails() {
    let backend = Arc::new(InMemoryBackend::default());
    let repository = Arc::new(InMemoryExecutionRepository::new());
    repository.upsert(execution("e1", "pipeline"));
    let tracking =
        ActiveExecutionMonitor::new(backend.clone(), repository, &MonitorConfig::default());
    tracking.on_execution_started("pipeline", "e1").await.unwrap();

    let broken =
        ActiveExecutionMonitor::new(backend, Arc::new(BrokenRepository), &MonitorConfig::default());
    let summary = broken.cleanup().await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.removed, 0);
    assert_eq!(broken.records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn listener_applies_events_until_channel_closes() {
    let f = fixture();
    f.repository.upsert(execution("e1", "pipeline"));
    f.repository.upsert(execution("e2", "pipeline"));

    let (tx, rx) = mpsc::channel(8);
    let handle = Arc::clone(&f.monitor).spawn_listener(rx);

    for event in [
        LifecycleEvent::ExecutionStarted {
            execution_type: "pipeline".to_string(),
            execution_id: "e1".to_string(),
        },
        LifecycleEvent::ExecutionStarted {
            execution_type: "pipeline".to_string(),
            execution_id: "e2".to_string(),
        },
        LifecycleEvent::ExecutionComplete {
            execution_id: "e1".to_string(),
        },
    ] {
        tx.send(event).await.unwrap();
    }
    drop(tx);
    handle.await.unwrap();

    let records = f.monitor.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "e2");
}

#[test]
fn lifecycle_events_use_a_type_tag() {
    let event: LifecycleEvent = serde_json::from_str(
        r#"{"type": "execution_started", "execution_type": "pipeline", "execution_id": "e1"}"#,
    )
    .unwrap();
    assert_eq!(
        event,
        LifecycleEvent::ExecutionStarted {
            execution_type: "pipeline".to_string(),
            execution_id: "e1".to_string(),
        }
    );
}
