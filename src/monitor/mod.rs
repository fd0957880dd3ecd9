//! Live count of in-flight executions by type.
//!
//! Start and completion notifications write and delete one record per
//! execution in the shared backend. A periodic sweep re-checks every record
//! against the authoritative execution store and prunes records whose
//! execution is gone or finished. The authoritative store is never written.

pub mod repository;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use opentelemetry::KeyValue;
use opentelemetry::metrics::ObservableGauge;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::KeyValueBackend;
use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

pub use repository::{ExecutionRepository, ExecutionSummary, InMemoryExecutionRepository};

/// Notifications consumed from the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ExecutionStarted {
        execution_type: String,
        execution_id: String,
    },
    ExecutionComplete {
        execution_id: String,
    },
}

/// What the monitor keeps per running execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveExecution {
    pub id: String,
    pub execution_type: String,
    pub application: String,
}

/// What one cleanup sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupSummary {
    pub checked: usize,
    pub removed: usize,
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Other("active execution snapshot lock poisoned".to_string())
}

pub struct ActiveExecutionMonitor {
    backend: Arc<dyn KeyValueBackend>,
    repository: Arc<dyn ExecutionRepository>,
    records_key: String,
    snapshot: Arc<RwLock<HashMap<String, u64>>>,
    registered: Mutex<HashSet<String>>,
    gauges: Mutex<Vec<ObservableGauge<u64>>>,
}

impl ActiveExecutionMonitor {
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        repository: Arc<dyn ExecutionRepository>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            backend,
            repository,
            records_key: config.records_key.clone(),
            snapshot: Arc::new(RwLock::new(HashMap::new())),
            registered: Mutex::new(HashSet::new()),
            gauges: Mutex::new(Vec::new()),
        }
    }

    pub async fn on_event(&self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::ExecutionStarted {
                execution_type,
                execution_id,
            } => {
                self.on_execution_started(&execution_type, &execution_id)
                    .await
            }
            LifecycleEvent::ExecutionComplete { execution_id } => {
                self.on_execution_complete(&execution_id).await
            }
        }
    }

    /// Record a started execution. Lookup failures are logged and dropped;
    /// the next cleanup or start event gets another chance.
    pub async fn on_execution_started(&self, execution_type: &str, id: &str) -> Result<()> {
        let execution = match self.repository.retrieve(execution_type, id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                warn!(execution_type, id, "started execution not found, not tracking");
                return Ok(());
            }
            Err(e) => {
                error!(execution_type, id, %e, "failed to look up started execution");
                return Ok(());
            }
        };

        let record = ActiveExecution {
            id: execution.id,
            execution_type: execution.execution_type,
            application: execution.application,
        };
        let body = serde_json::to_string(&record)?;
        self.backend.hset(&self.records_key, &record.id, &body).await?;
        debug!(execution_type, id, "tracking active execution");
        Ok(())
    }

    pub async fn on_execution_complete(&self, id: &str) -> Result<()> {
        if self.backend.hdel(&self.records_key, id).await? {
            debug!(id, "active execution completed");
        }
        Ok(())
    }

    /// Handle events from `events` on a background task until the sender
    /// side closes, so publishers never wait on the backend.
    pub fn spawn_listener(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.on_event(event).await {
                    error!(%e, "failed to handle lifecycle event");
                }
            }
            debug!("lifecycle event channel closed");
        })
    }

    /// All records currently stored. Unreadable records are skipped.
    pub async fn records(&self) -> Result<Vec<ActiveExecution>> {
        let raw = self.backend.hgetall(&self.records_key).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(id, body)| match serde_json::from_str(&body) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(id, %e, "unreadable active execution record");
                    None
                }
            })
            .collect())
    }

    /// Rebuild the per-type snapshot and register a gauge for each type seen
    /// for the first time. Types that drop to zero keep reporting zero.
    pub async fn register_gauges(&self) -> Result<HashMap<String, u64>> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for record in self.records().await? {
            *counts.entry(record.execution_type).or_default() += 1;
        }

        let mut registered = self.registered.lock().map_err(poisoned)?;
        for execution_type in registered.iter() {
            counts.entry(execution_type.clone()).or_default();
        }
        *self.snapshot.write().map_err(poisoned)? = counts.clone();

        let mut gauges = self.gauges.lock().map_err(poisoned)?;
        for execution_type in counts.keys() {
            if registered.insert(execution_type.clone()) {
                gauges.push(self.active_gauge(execution_type.clone()));
                info!(execution_type, "registered active execution gauge");
            }
        }
        Ok(counts)
    }

    fn active_gauge(&self, execution_type: String) -> ObservableGauge<u64> {
        let snapshot = Arc::clone(&self.snapshot);
        metrics::meter()
            .u64_observable_gauge("workq.executions.active")
            .with_description("Executions currently running, by type")
            .with_callback(move |observer| {
                let count = snapshot
                    .read()
                    .map(|s| s.get(&execution_type).copied().unwrap_or(0))
                    .unwrap_or(0);
                observer.observe(
                    count,
                    &[KeyValue::new("execution_type", execution_type.clone())],
                );
            })
            .build()
    }

    /// Counts from the last [`Self::register_gauges`] run.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.snapshot
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Drop records whose execution the authoritative store reports missing
    /// or complete. Records whose lookup fails are kept for the next sweep.
    pub async fn cleanup(&self) -> Result<CleanupSummary> {
        let raw = self.backend.hgetall(&self.records_key).await?;
        let mut summary = CleanupSummary::default();

        for (id, body) in raw {
            summary.checked += 1;
            let record: ActiveExecution = match serde_json::from_str(&body) {
                Ok(record) => record,
                Err(e) => {
                    error!(id, %e, "removing unreadable active execution record");
                    self.backend.hdel(&self.records_key, &id).await?;
                    summary.removed += 1;
                    continue;
                }
            };

            let orphaned = match self
                .repository
                .retrieve(&record.execution_type, &record.id)
                .await
            {
                Ok(None) => true,
                Ok(Some(execution)) => execution.complete,
                Err(e) => {
                    warn!(id, %e, "execution lookup failed during cleanup, keeping record");
                    false
                }
            };

            if orphaned {
                self.backend.hdel(&self.records_key, &id).await?;
                summary.removed += 1;
                info!(
                    id,
                    execution_type = %record.execution_type,
                    application = %record.application,
                    "removed orphaned active execution"
                );
            }
        }
        Ok(summary)
    }
}
