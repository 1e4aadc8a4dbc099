//! Workflow engine
//!
//! Drives executions forward one step at a time, persisting after every
//! transition so a restarted process can resume where the last one stopped.
//! On failure (or cancellation) completed steps are compensated in strict
//! reverse order.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::retry::RetryPolicy;

use super::{
    StepContext, StepError, StepStatus, WorkflowDefinition, WorkflowError, WorkflowExecution,
    WorkflowRepository, WorkflowStatus, WorkflowStep,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-attempt timeout when neither step nor definition sets one
    pub step_timeout: Duration,
    pub step_retry: RetryPolicy,
    pub compensation_retry: RetryPolicy,
    /// Concurrently running spawned workflows
    pub workers: usize,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            step_timeout: config.step_timeout,
            step_retry: config.step_retry(),
            // Compensation gets more patience than the forward path
            compensation_retry: RetryPolicy::new(
                config.step_max_attempts.saturating_mul(2),
                config.step_backoff,
            ),
            workers: config.workflow_workers,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            step_retry: RetryPolicy::new(3, Duration::from_millis(100)),
            compensation_retry: RetryPolicy::new(6, Duration::from_millis(100)),
            workers: 8,
        }
    }
}

/// A workflow running on the worker pool
#[derive(Debug)]
pub struct WorkflowHandle {
    workflow_id: Uuid,
    task: JoinHandle<Result<WorkflowExecution, WorkflowError>>,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Wait for the workflow to finish
    pub async fn wait(self) -> Result<WorkflowExecution, WorkflowError> {
        self.task
            .await
            .map_err(|e| WorkflowError::Join(e.to_string()))?
    }
}

/// Releases a claimed execution when dropped
struct ActiveGuard {
    active: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    repository: Arc<dyn WorkflowRepository>,
    config: EngineConfig,
    workers: Arc<Semaphore>,
    /// Executions driven by this process right now
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl WorkflowEngine {
    pub fn new(repository: Arc<dyn WorkflowRepository>, config: EngineConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            repository,
            config,
            workers,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn repository(&self) -> &Arc<dyn WorkflowRepository> {
        &self.repository
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<WorkflowExecution>, WorkflowError> {
        self.repository.get(id).await
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Persist a new execution and drive it. An existing execution with the
    /// same id is resumed instead.
    pub async fn start(
        &self,
        id: Uuid,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let execution = WorkflowExecution::new(
            id,
            definition.workflow_type(),
            definition.input().clone(),
            definition.step_names(),
            Utc::now(),
        );

        if self.repository.create(&execution).await? {
            tracing::info!(
                workflow_id = %id,
                workflow_type = definition.workflow_type(),
                steps = execution.steps.len(),
                "Workflow started"
            );
            self.drive(execution, &definition).await
        } else {
            tracing::debug!(workflow_id = %id, "Workflow exists, resuming");
            self.resume(id, definition).await
        }
    }

    /// Run `start` on the worker pool
    pub fn spawn(&self, id: Uuid, definition: WorkflowDefinition) -> WorkflowHandle {
        let engine = self.clone();
        let task = tokio::spawn(async move {
            let _permit = Arc::clone(&engine.workers)
                .acquire_owned()
                .await
                .map_err(|_| WorkflowError::WorkerPoolClosed)?;
            engine.start(id, definition).await
        });

        WorkflowHandle {
            workflow_id: id,
            task,
        }
    }

    /// Continue a persisted execution from where it stopped
    pub async fn resume(
        &self,
        id: Uuid,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let execution = self
            .repository
            .get(id)
            .await?
            .ok_or(WorkflowError::NotFound(id))?;
        self.drive(execution, &definition).await
    }

    /// Request cancellation. The driver compensates before its next step.
    pub async fn cancel(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let execution = self.repository.request_cancel(id).await?;
        tracing::info!(workflow_id = %id, status = execution.status.as_str(), "Cancellation requested");
        Ok(execution)
    }

    /// Cancel and compensate right away
    pub async fn cancel_and_compensate(
        &self,
        id: Uuid,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowExecution, WorkflowError> {
        self.cancel(id).await?;
        self.resume(id, definition).await
    }

    // =========================================================================
    // Driver
    // =========================================================================

    async fn drive(
        &self,
        execution: WorkflowExecution,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let id = execution.id;
        check_definition(&execution, definition)?;

        let _guard = self.claim(id)?;

        // Another process may have moved it on since it was read
        let execution = self.repository.get(id).await?.unwrap_or(execution);

        if execution.requires_intervention {
            return Err(WorkflowError::RequiresIntervention(id));
        }

        match execution.status {
            WorkflowStatus::Completed | WorkflowStatus::Compensated => Ok(execution),
            WorkflowStatus::Running => self.run_forward(execution, definition).await,
            WorkflowStatus::Failed | WorkflowStatus::Compensating => {
                self.run_compensation(execution, definition).await
            }
        }
    }

    async fn run_forward(
        &self,
        mut execution: WorkflowExecution,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowExecution, WorkflowError> {
        while let Some(index) = execution.next_step() {
            if self.repository.cancel_requested(execution.id).await? {
                tracing::info!(workflow_id = %execution.id, "Workflow cancelled, compensating");
                execution.cancel_requested = true;
                execution.status = WorkflowStatus::Failed;
                execution.error = Some("cancelled".to_string());
                self.save(&mut execution).await?;
                return self.run_compensation(execution, definition).await;
            }

            match self.execute_step(&mut execution, definition, index).await? {
                Ok(result) => {
                    let record = &mut execution.steps[index];
                    record.status = StepStatus::Done;
                    record.result = Some(result);
                    record.error = None;
                    record.error_code = None;
                    tracing::debug!(
                        workflow_id = %execution.id,
                        step = %record.name,
                        "Step completed"
                    );
                    self.save(&mut execution).await?;
                }
                Err(err) => {
                    let record = &mut execution.steps[index];
                    record.status = StepStatus::Failed;
                    record.error = Some(err.to_string());
                    record.error_code = Some(err.code());
                    let name = record.name.clone();

                    tracing::warn!(
                        workflow_id = %execution.id,
                        step = %name,
                        error = %err,
                        "Step failed, compensating"
                    );

                    execution.status = WorkflowStatus::Failed;
                    execution.error = Some(format!("{name}: {err}"));
                    self.save(&mut execution).await?;
                    return self.run_compensation(execution, definition).await;
                }
            }
        }

        execution.status = WorkflowStatus::Completed;
        self.save(&mut execution).await?;
        tracing::info!(workflow_id = %execution.id, "Workflow completed");
        Ok(execution)
    }

    /// Run one step to a final outcome, retrying what can be retried.
    /// The outer error is for storage failures only.
    async fn execute_step(
        &self,
        execution: &mut WorkflowExecution,
        definition: &WorkflowDefinition,
        index: usize,
    ) -> Result<Result<serde_json::Value, StepError>, WorkflowError> {
        let step = Arc::clone(&definition.steps()[index]);
        let timeout = self.timeout_for(step.as_ref(), definition);
        let policy = self.config.step_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            execution.steps[index].attempts += 1;
            self.save(execution).await?;

            let ctx = StepContext::new(
                execution.id,
                index,
                execution.steps[index].attempts,
                Utc::now(),
            );

            let err = match tokio::time::timeout(timeout, step.execute(&ctx)).await {
                Ok(Ok(result)) => return Ok(Ok(result)),
                Ok(Err(err)) => err,
                Err(_) => StepError::Timeout(timeout),
            };

            if matches!(err, StepError::Timeout(_)) {
                if let Some(result) = self.probe(step.as_ref(), &ctx, timeout).await {
                    tracing::info!(
                        workflow_id = %execution.id,
                        step = step.name(),
                        "Timed out step was applied"
                    );
                    return Ok(Ok(result));
                }
            }

            if err.is_retryable() && policy.should_retry(attempt) {
                tracing::warn!(
                    workflow_id = %execution.id,
                    step = step.name(),
                    attempt,
                    error = %err,
                    "Step attempt failed, retrying"
                );
                policy.wait(attempt).await;
                continue;
            }

            return Ok(Err(err));
        }
    }

    async fn probe(
        &self,
        step: &dyn WorkflowStep,
        ctx: &StepContext,
        timeout: Duration,
    ) -> Option<serde_json::Value> {
        match tokio::time::timeout(timeout, step.probe(ctx)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(workflow_id = %ctx.workflow_id, step = step.name(), error = %err, "Probe failed");
                None
            }
            Err(_) => {
                tracing::warn!(workflow_id = %ctx.workflow_id, step = step.name(), "Probe timed out");
                None
            }
        }
    }

    // =========================================================================
    // Compensation
    // =========================================================================

    async fn run_compensation(
        &self,
        mut execution: WorkflowExecution,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowExecution, WorkflowError> {
        if execution.status != WorkflowStatus::Compensating {
            execution.status = WorkflowStatus::Compensating;
            self.save(&mut execution).await?;
        }

        for index in (0..execution.steps.len()).rev() {
            if !self.settle_in_doubt(&mut execution, definition, index).await? {
                continue;
            }

            let result = execution.steps[index].result.clone();
            match self
                .compensate_step(&execution, definition, index, result.as_ref())
                .await
            {
                Ok(()) => {
                    execution.steps[index].status = StepStatus::Compensated;
                    tracing::debug!(
                        workflow_id = %execution.id,
                        step = %execution.steps[index].name,
                        "Step compensated"
                    );
                    self.save(&mut execution).await?;
                }
                Err(err) => {
                    let step = execution.steps[index].name.clone();
                    execution.status = WorkflowStatus::Failed;
                    execution.requires_intervention = true;
                    execution.error = Some(format!("compensation of {step} failed: {err}"));
                    self.save(&mut execution).await?;

                    tracing::error!(
                        workflow_id = %execution.id,
                        step = %step,
                        error = %err,
                        "Compensation failed, operator intervention required"
                    );
                    return Err(WorkflowError::CompensationFailed {
                        workflow_id: execution.id,
                        step,
                        reason: err.to_string(),
                    });
                }
            }
        }

        execution.status = WorkflowStatus::Compensated;
        self.save(&mut execution).await?;
        tracing::info!(workflow_id = %execution.id, "Workflow compensated");
        Ok(execution)
    }

    /// Whether step `index` has an effect to undo. A step that was attempted
    /// but never recorded as done (crash, timeout) is probed first; if its
    /// effect landed it is marked `Done`.
    async fn settle_in_doubt(
        &self,
        execution: &mut WorkflowExecution,
        definition: &WorkflowDefinition,
        index: usize,
    ) -> Result<bool, WorkflowError> {
        let record = &execution.steps[index];
        match record.status {
            StepStatus::Done => return Ok(true),
            StepStatus::Compensated => return Ok(false),
            StepStatus::Pending | StepStatus::Failed if record.attempts == 0 => return Ok(false),
            StepStatus::Pending | StepStatus::Failed => {}
        }

        let step = Arc::clone(&definition.steps()[index]);
        let timeout = self.timeout_for(step.as_ref(), definition);
        let ctx = StepContext::new(execution.id, index, record.attempts, Utc::now());

        let Some(result) = self.probe(step.as_ref(), &ctx, timeout).await else {
            return Ok(false);
        };

        tracing::warn!(
            workflow_id = %execution.id,
            step = step.name(),
            "Unrecorded step effect found, compensating it"
        );
        let record = &mut execution.steps[index];
        record.status = StepStatus::Done;
        record.result = Some(result);
        self.save(execution).await?;
        Ok(true)
    }

    async fn compensate_step(
        &self,
        execution: &WorkflowExecution,
        definition: &WorkflowDefinition,
        index: usize,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StepError> {
        let step = Arc::clone(&definition.steps()[index]);
        let timeout = self.timeout_for(step.as_ref(), definition);
        let policy = self.config.compensation_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let ctx = StepContext::new(execution.id, index, attempt, Utc::now());

            let err = match tokio::time::timeout(timeout, step.compensate(&ctx, result)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err,
                Err(_) => StepError::Timeout(timeout),
            };

            if err.is_retryable() && policy.should_retry(attempt) {
                tracing::warn!(
                    workflow_id = %execution.id,
                    step = step.name(),
                    attempt,
                    error = %err,
                    "Compensation attempt failed, retrying"
                );
                policy.wait(attempt).await;
                continue;
            }

            return Err(err);
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn timeout_for(&self, step: &dyn WorkflowStep, definition: &WorkflowDefinition) -> Duration {
        step.timeout()
            .or(definition.step_timeout())
            .unwrap_or(self.config.step_timeout)
    }

    async fn save(&self, execution: &mut WorkflowExecution) -> Result<(), WorkflowError> {
        execution.updated_at = Utc::now();
        self.repository.save(execution).await
    }

    fn claim(&self, id: Uuid) -> Result<ActiveGuard, WorkflowError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(id) {
            return Err(WorkflowError::AlreadyRunning(id));
        }
        Ok(ActiveGuard {
            active: Arc::clone(&self.active),
            id,
        })
    }
}

fn check_definition(
    execution: &WorkflowExecution,
    definition: &WorkflowDefinition,
) -> Result<(), WorkflowError> {
    if execution.workflow_type != definition.workflow_type() {
        return Err(WorkflowError::DefinitionMismatch {
            workflow_id: execution.id,
            reason: format!(
                "execution is {}, definition is {}",
                execution.workflow_type,
                definition.workflow_type()
            ),
        });
    }

    let names = definition.step_names();
    let recorded: Vec<&str> = execution.steps.iter().map(|s| s.name.as_str()).collect();
    if names.iter().map(String::as_str).ne(recorded.iter().copied()) {
        return Err(WorkflowError::DefinitionMismatch {
            workflow_id: execution.id,
            reason: format!("steps {recorded:?} vs {names:?}"),
        });
    }

    Ok(())
}
