//! Workflow steps

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{DomainError, OperationContext};
use crate::error::AppError;

/// Step failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    /// Business rule violation; retrying cannot help
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    /// Permanent refusal by a collaborator
    #[error("Rejected ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl StepError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Infrastructure(_) | StepError::Timeout(_))
    }

    pub fn code(&self) -> String {
        match self {
            StepError::Domain(e) => e.error_code().to_string(),
            StepError::Infrastructure(_) => "infrastructure_error".to_string(),
            StepError::Timeout(_) => "step_timeout".to_string(),
            StepError::Rejected { code, .. } => code.clone(),
        }
    }
}

impl From<AppError> for StepError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Domain(e) => StepError::Domain(e),
            e if e.is_retryable() => StepError::Infrastructure(e.to_string()),
            e => StepError::rejected(e.error_code(), e.to_string()),
        }
    }
}

/// Where a step runs: which workflow, which position, which attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub workflow_id: Uuid,
    pub step_index: usize,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl StepContext {
    pub fn new(workflow_id: Uuid, step_index: usize, attempt: u32, occurred_at: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            step_index,
            attempt,
            occurred_at,
        }
    }

    /// Same value on every attempt and after a restart
    pub fn idempotency_key(&self) -> Uuid {
        Uuid::new_v5(&self.workflow_id, format!("step:{}", self.step_index).as_bytes())
    }

    /// Key for the compensating action of this step
    pub fn compensation_key(&self) -> Uuid {
        Uuid::new_v5(
            &self.workflow_id,
            format!("compensate:{}", self.step_index).as_bytes(),
        )
    }

    /// Context for the forward command
    pub fn operation_context(&self) -> OperationContext {
        OperationContext::at(self.occurred_at)
            .with_correlation_id(self.workflow_id)
            .with_idempotency_key(self.idempotency_key())
    }

    /// Context for the compensating command
    pub fn compensation_context(&self) -> OperationContext {
        OperationContext::at(self.occurred_at)
            .with_correlation_id(self.workflow_id)
            .with_idempotency_key(self.compensation_key())
    }
}

/// One unit of work in a workflow, with an optional undo
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    fn name(&self) -> &str;

    /// Per-attempt timeout overriding the definition and engine defaults
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError>;

    /// Undo a completed `execute`. `result` is what it returned.
    async fn compensate(
        &self,
        _ctx: &StepContext,
        _result: Option<&serde_json::Value>,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// After a timeout, report whether the forward action took effect.
    /// `Ok(None)` means not applied (or unknown).
    async fn probe(&self, _ctx: &StepContext) -> Result<Option<serde_json::Value>, StepError> {
        Ok(None)
    }
}
