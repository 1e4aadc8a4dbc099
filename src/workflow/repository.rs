//! Workflow execution storage

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{WorkflowError, WorkflowExecution, WorkflowStatus};

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Insert a new execution. Returns `false` if the id already exists.
    async fn create(&self, execution: &WorkflowExecution) -> Result<bool, WorkflowError>;

    /// Overwrite an execution. Never clears `cancel_requested`.
    async fn save(&self, execution: &WorkflowExecution) -> Result<(), WorkflowError>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowExecution>, WorkflowError>;

    /// Set the cancel flag unless the workflow already completed.
    async fn request_cancel(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError>;

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, WorkflowError>;

    /// Executions that still have work to do, oldest first
    async fn list_incomplete(&self) -> Result<Vec<WorkflowExecution>, WorkflowError>;
}

fn check_cancellable(execution: &WorkflowExecution) -> Result<(), WorkflowError> {
    match execution.status {
        WorkflowStatus::Completed | WorkflowStatus::Compensated => {
            Err(WorkflowError::NotCancellable {
                workflow_id: execution.id,
                status: execution.status,
            })
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowRepository {
    executions: Arc<RwLock<HashMap<Uuid, WorkflowExecution>>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create(&self, execution: &WorkflowExecution) -> Result<bool, WorkflowError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Ok(false);
        }
        executions.insert(execution.id, execution.clone());
        Ok(true)
    }

    async fn save(&self, execution: &WorkflowExecution) -> Result<(), WorkflowError> {
        let mut executions = self.executions.write().await;
        let mut stored = execution.clone();
        if let Some(existing) = executions.get(&execution.id) {
            stored.cancel_requested |= existing.cancel_requested;
        }
        executions.insert(execution.id, stored);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowExecution>, WorkflowError> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or(WorkflowError::NotFound(id))?;
        check_cancellable(execution)?;
        execution.cancel_requested = true;
        Ok(execution.clone())
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, WorkflowError> {
        Ok(self
            .executions
            .read()
            .await
            .get(&id)
            .map(|e| e.cancel_requested)
            .unwrap_or(false))
    }

    async fn list_incomplete(&self) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        let executions = self.executions.read().await;
        let mut incomplete: Vec<WorkflowExecution> = executions
            .values()
            .filter(|e| !e.is_finished())
            .cloned()
            .collect();
        incomplete.sort_by_key(|e| e.created_at);
        Ok(incomplete)
    }
}
