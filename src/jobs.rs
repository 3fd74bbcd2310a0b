//! Run registry: an injected key-value store for job tracking
//!
//! The HTTP layer that fronts this store lives elsewhere; the engine only
//! needs create/read/delete semantics, injected rather than process-global
//! so the job layer tests independently of the engine.

use crate::backtest::BacktestResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BacktestResult>,
}

/// In-memory job store; safe to share across tasks
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
    counter: AtomicU64,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new queued job and return its id
    pub fn create(&self) -> String {
        let id = format!("job-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        let record = JobRecord {
            id: id.clone(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            result: None,
        };
        self.jobs
            .lock()
            .expect("job store lock poisoned")
            .insert(id.clone(), record);
        id
    }

    pub fn read(&self, id: &str) -> Option<JobRecord> {
        self.jobs
            .lock()
            .expect("job store lock poisoned")
            .get(id)
            .cloned()
    }

    /// Update a job's status, attaching the result when finished
    pub fn update(&self, id: &str, status: JobStatus, result: Option<BacktestResult>) {
        if let Some(record) = self
            .jobs
            .lock()
            .expect("job store lock poisoned")
            .get_mut(id)
        {
            record.status = status;
            if result.is_some() {
                record.result = result;
            }
        }
    }

    pub fn delete(&self, id: &str) -> bool {
        self.jobs
            .lock()
            .expect("job store lock poisoned")
            .remove(id)
            .is_some()
    }
}
