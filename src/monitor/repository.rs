//! Read access to the authoritative execution store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What the monitor needs to know about an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: String,
    pub execution_type: String,
    pub application: String,
    /// The execution has reached a terminal status.
    pub complete: bool,
}

/// The system of record for executions. Read-only from this crate.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// None if the store has no such execution.
    async fn retrieve(&self, execution_type: &str, id: &str) -> Result<Option<ExecutionSummary>>;
}

/// Map-backed repository for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<String, ExecutionSummary>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, execution: ExecutionSummary) {
        if let Ok(mut map) = self.executions.write() {
            map.insert(execution.id.clone(), execution);
        }
    }

    pub fn remove(&self, id: &str) {
        if let Ok(mut map) = self.executions.write() {
            map.remove(id);
        }
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn retrieve(&self, execution_type: &str, id: &str) -> Result<Option<ExecutionSummary>> {
        let map = self
            .executions
            .read()
            .map_err(|_| Error::Other("execution repository lock poisoned".to_string()))?;
        Ok(map
            .get(id)
            .filter(|e| e.execution_type == execution_type)
            .cloned())
    }
}
