//! Run state, stage records, and cancellation.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Execution status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting on dependencies.
    Pending,
    /// Dispatching to a model.
    Running,
    /// Output is being validated.
    Validating,
    /// Validation failed; re-dispatching with feedback.
    Retrying,
    /// Output accepted.
    Succeeded,
    /// Retries exhausted or a permanent failure occurred.
    Failed,
    /// Never dispatched: a dependency failed or the run was cancelled.
    Skipped,
}

impl StageStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Status log entry for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage id.
    pub stage: String,
    /// Current status.
    pub status: StageStatus,
    /// Dispatch attempts made (initial attempt included).
    pub attempts: u32,
    /// Model that produced the accepted output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Failure or skip reason, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the stage left `pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    /// Creates a pending record for a stage.
    #[must_use]
    pub fn pending(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pending,
            attempts: 0,
            model: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Terminal status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage succeeded.
    Succeeded,
    /// At least one stage failed or was skipped.
    PartiallyFailed,
    /// The run's cancellation signal fired.
    Cancelled,
}

/// Final result of a pipeline run, handed to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Run id.
    pub run_id: Uuid,
    /// Terminal status.
    pub status: RunStatus,
    /// Output key to accepted content, including the seed.
    pub outputs: HashMap<String, String>,
    /// Per-stage records in declaration order.
    pub stages: Vec<StageRecord>,
}

impl RunResult {
    /// Returns the record for a stage id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == id)
    }
}

/// Token for cancelling a run.
///
/// Idempotent: only the first reason is stored.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelToken {
    /// Creates a new token.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Requests cancellation with a reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            *self.reason.lock() = Some(reason.into());
        }
    }
}

/// Mutable shared state for one pipeline run.
#[derive(Debug)]
pub struct PipelineRun {
    /// Run id.
    pub id: Uuid,
    outputs: RwLock<HashMap<String, String>>,
    records: RwLock<HashMap<String, StageRecord>>,
    cancel: Arc<CancelToken>,
}

impl PipelineRun {
    /// Creates a run seeded with the initial context entry.
    #[must_use]
    pub fn new(seed_key: &str, seed_content: &str, cancel: Arc<CancelToken>) -> Self {
        let mut outputs = HashMap::new();
        outputs.insert(seed_key.to_string(), seed_content.to_string());
        Self {
            id: Uuid::new_v4(),
            outputs: RwLock::new(outputs),
            records: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<CancelToken> {
        self.cancel.clone()
    }

    /// Returns true if the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reads an accepted output by key.
    #[must_use]
    pub fn output(&self, key: &str) -> Option<String> {
        self.outputs.read().get(key).cloned()
    }

    /// Stores an accepted output.
    pub fn store_output(&self, key: &str, content: &str) {
        self.outputs
            .write()
            .insert(key.to_string(), content.to_string());
    }

    /// Snapshot of all outputs.
    #[must_use]
    pub fn outputs(&self) -> HashMap<String, String> {
        self.outputs.read().clone()
    }

    /// Initializes a pending record for a stage.
    pub fn init_record(&self, stage: &str) {
        self.records
            .write()
            .insert(stage.to_string(), StageRecord::pending(stage));
    }

    /// Updates a stage's status, stamping timestamps on transitions.
    pub fn set_status(&self, stage: &str, status: StageStatus) {
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(stage) {
            if record.started_at.is_none() && status != StageStatus::Pending {
                record.started_at = Some(Utc::now());
            }
            if status.is_terminal() {
                record.finished_at = Some(Utc::now());
            }
            record.status = status;
        }
    }

    /// Applies an arbitrary mutation to a stage record.
    pub fn update_record<F>(&self, stage: &str, f: F)
    where
        F: FnOnce(&mut StageRecord),
    {
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(stage) {
            f(record);
        }
    }

    /// Reads a copy of a stage record.
    #[must_use]
    pub fn record(&self, stage: &str) -> Option<StageRecord> {
        self.records.read().get(stage).cloned()
    }
}
