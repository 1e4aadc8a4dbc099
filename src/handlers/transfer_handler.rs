//! Transfer Handler
//!
//! At-most-once transfers. The transfer id doubles as the workflow id, so a
//! resubmitted transfer finds its own stream and workflow and picks up where
//! the first attempt stopped instead of moving money twice.

use futures::StreamExt;
use std::sync::Arc;
use uuid::Uuid;

use crate::aggregate::{rehydrate, Aggregate, Transfer};
use crate::domain::{DomainError, DomainEvent, Money, OperationContext, TransferEvent};
use crate::error::{AppError, AppResult};
use crate::event_store::{encode_events, load_stream, EventLog, EventLogError};
use crate::workflow::{StepStatus, WorkflowEngine, WorkflowError, WorkflowExecution, WorkflowStatus};
use crate::workflows::{TransferInput, TransferWorkflow};

use super::{AccountService, TransferCommand, TransferResult};

/// Service for transfers between ledger accounts
#[derive(Clone)]
pub struct TransferService {
    accounts: AccountService,
    engine: WorkflowEngine,
}

impl TransferService {
    pub fn new(accounts: AccountService, engine: WorkflowEngine) -> Self {
        Self { accounts, engine }
    }

    fn log(&self) -> &Arc<dyn EventLog> {
        self.accounts.log()
    }

    pub async fn load(&self, transfer_id: Uuid) -> AppResult<Option<Transfer>> {
        let events = load_stream(self.log().as_ref(), transfer_id).await?;
        Ok(rehydrate(&events)?)
    }

    pub async fn get(&self, transfer_id: Uuid) -> AppResult<TransferResult> {
        let transfer = self
            .load(transfer_id)
            .await?
            .ok_or(AppError::Domain(DomainError::TransferNotFound(transfer_id)))?;
        Ok(TransferResult::from(&transfer))
    }

    /// Execute the transfer command.
    ///
    /// A business failure of either leg is not an error: the result carries
    /// status `failed` or `compensated`. Only a failed compensation (money
    /// possibly stranded) surfaces as `CompensationFailure`.
    pub async fn execute(
        &self,
        command: TransferCommand,
        ctx: &OperationContext,
    ) -> AppResult<TransferResult> {
        let transfer_id = command
            .transfer_id
            .or(ctx.idempotency_key)
            .unwrap_or_else(Uuid::new_v4);

        if let Some(existing) = self.load(transfer_id).await? {
            tracing::debug!(transfer_id = %transfer_id, status = ?existing.status(), "Transfer resubmitted");
            return self.settle_loaded(existing, ctx).await;
        }

        // Both accounts must exist before anything is recorded
        let from = self.accounts.get(command.from_account_id).await?;
        self.accounts.get(command.to_account_id).await?;

        let asset_code = command
            .asset_code
            .clone()
            .unwrap_or_else(|| from.asset_code().clone());
        let amount = Money::new(command.amount, asset_code).map_err(DomainError::from)?;
        let description = command
            .description
            .clone()
            .unwrap_or_else(|| "Transfer".to_string());

        let (transfer, event) = Transfer::initiate(
            transfer_id,
            transfer_id,
            command.from_account_id,
            command.to_account_id,
            amount,
            description,
            ctx,
        )?;

        match self
            .log()
            .append(transfer_id, 0, encode_events(&[event], None)?)
            .await
        {
            Ok(_) => {
                tracing::info!(
                    transfer_id = %transfer_id,
                    from_account_id = %command.from_account_id,
                    to_account_id = %command.to_account_id,
                    amount = %transfer.amount(),
                    "Transfer initiated"
                );
                self.settle_loaded(transfer, ctx).await
            }
            // Initiated concurrently under the same id
            Err(EventLogError::ConcurrencyConflict { .. }) => self.settle(transfer_id, ctx).await,
            Err(err) => Err(err.into()),
        }
    }

    /// Drive a pending transfer to its final state. Terminal transfers are
    /// returned as recorded.
    pub async fn settle(&self, transfer_id: Uuid, ctx: &OperationContext) -> AppResult<TransferResult> {
        let transfer = self
            .load(transfer_id)
            .await?
            .ok_or(AppError::Domain(DomainError::TransferNotFound(transfer_id)))?;
        self.settle_loaded(transfer, ctx).await
    }

    /// Settle every transfer still `Pending` in the log.
    ///
    /// Covers a process that died between `TransferInitiated` and starting
    /// the workflow, or between the workflow finishing and the outcome
    /// event. Returns how many transfers reached a terminal state.
    pub async fn settle_pending(&self, ctx: &OperationContext) -> AppResult<usize> {
        let mut settled = 0;

        for aggregate_id in self.log().aggregate_ids().await? {
            let first = self.log().read(aggregate_id, 1).next().await.transpose()?;
            if !first.is_some_and(|e| TransferEvent::handles(&e.event_type)) {
                continue;
            }

            let Some(transfer) = self.load(aggregate_id).await? else {
                continue;
            };
            if transfer.status().is_terminal() || self.engine.is_active(transfer.workflow_id()) {
                continue;
            }

            match self.settle_loaded(transfer, ctx).await {
                Ok(result) if result.status.is_terminal() => {
                    tracing::info!(transfer_id = %aggregate_id, status = ?result.status, "Pending transfer settled");
                    settled += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(transfer_id = %aggregate_id, error = %e, "Settling pending transfer failed")
                }
            }
        }

        Ok(settled)
    }

    async fn settle_loaded(
        &self,
        transfer: Transfer,
        ctx: &OperationContext,
    ) -> AppResult<TransferResult> {
        if transfer.status().is_terminal() {
            return Ok(TransferResult::from(&transfer));
        }

        let input = TransferInput {
            transfer_id: transfer.id(),
            from_account_id: transfer.from_account_id(),
            to_account_id: transfer.to_account_id(),
            amount: transfer.amount().clone(),
            description: transfer.description().to_string(),
        };
        let definition = TransferWorkflow::definition(&self.accounts, &input)?;

        let execution = match self.engine.start(transfer.workflow_id(), definition).await {
            Ok(execution) => execution,
            // Another request is driving it; report it as still pending
            Err(WorkflowError::AlreadyRunning(_)) => return Ok(TransferResult::from(&transfer)),
            Err(err) => return Err(err.into()),
        };

        let event = outcome_event(&transfer, &execution, ctx)?;
        self.record_outcome(transfer, event).await
    }

    async fn record_outcome(
        &self,
        transfer: Transfer,
        event: TransferEvent,
    ) -> AppResult<TransferResult> {
        let transfer_id = transfer.id();
        match self
            .log()
            .append(transfer_id, transfer.version(), encode_events(&[event.clone()], None)?)
            .await
        {
            Ok(_) => {
                let transfer = transfer.apply(event)?;
                tracing::info!(
                    transfer_id = %transfer_id,
                    status = ?transfer.status(),
                    "Transfer finished"
                );
                Ok(TransferResult::from(&transfer))
            }
            // Someone else recorded the outcome first
            Err(EventLogError::ConcurrencyConflict { .. }) => self.get(transfer_id).await,
            Err(err) => Err(err.into()),
        }
    }
}

/// Terminal transfer event matching a finished workflow
fn outcome_event(
    transfer: &Transfer,
    execution: &WorkflowExecution,
    ctx: &OperationContext,
) -> AppResult<TransferEvent> {
    let reason = || {
        execution
            .error
            .clone()
            .unwrap_or_else(|| "transfer failed".to_string())
    };

    let event = match execution.status {
        WorkflowStatus::Completed => transfer.complete(ctx)?,
        WorkflowStatus::Compensated => {
            let reversed = execution
                .steps
                .iter()
                .any(|s| s.status == StepStatus::Compensated);
            if reversed {
                transfer.compensate(reason(), ctx)?
            } else {
                transfer.fail(reason(), ctx)?
            }
        }
        status => {
            return Err(AppError::Internal(format!(
                "workflow {} returned in state {}",
                execution.id,
                status.as_str()
            )))
        }
    };
    Ok(event)
}
