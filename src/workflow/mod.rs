//! Workflow (saga) engine
//!
//! Multi-step business processes with persisted progress, bounded retries,
//! per-step timeouts and reverse-order compensation.

mod engine;
mod execution;
mod postgres;
mod repository;
mod step;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use engine::{EngineConfig, WorkflowEngine, WorkflowHandle};
pub use execution::{StepRecord, StepStatus, WorkflowExecution, WorkflowStatus};
pub use postgres::PgWorkflowRepository;
pub use repository::{InMemoryWorkflowRepository, WorkflowRepository};
pub use step::{StepContext, StepError, WorkflowStep};

/// Workflow errors
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(Uuid),

    #[error("Workflow {workflow_id} does not match its definition: {reason}")]
    DefinitionMismatch { workflow_id: Uuid, reason: String },

    /// Fatal; the execution is flagged for operator intervention
    #[error("Compensation of step {step} failed for workflow {workflow_id}: {reason}")]
    CompensationFailed {
        workflow_id: Uuid,
        step: String,
        reason: String,
    },

    #[error("Workflow {0} requires operator intervention")]
    RequiresIntervention(Uuid),

    #[error("Workflow {workflow_id} cannot be cancelled in state {status:?}")]
    NotCancellable {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    /// Another driver in this process owns the execution
    #[error("Workflow {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("Invalid workflow input: {0}")]
    InvalidInput(String),

    #[error("Corrupted workflow record: {0}")]
    Corrupted(String),

    #[error("Worker pool closed")]
    WorkerPoolClosed,

    #[error("Workflow task failed: {0}")]
    Join(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Ordered steps plus the input they were built from
#[derive(Clone)]
pub struct WorkflowDefinition {
    workflow_type: String,
    input: serde_json::Value,
    steps: Vec<Arc<dyn WorkflowStep>>,
    step_timeout: Option<Duration>,
}

impl WorkflowDefinition {
    pub fn new(workflow_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            input,
            steps: Vec::new(),
            step_timeout: None,
        }
    }

    pub fn step(mut self, step: impl WorkflowStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Timeout for every step that doesn't set its own
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn steps(&self) -> &[Arc<dyn WorkflowStep>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("workflow_type", &self.workflow_type)
            .field("steps", &self.step_names())
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}
