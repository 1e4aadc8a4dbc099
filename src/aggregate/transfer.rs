//! Transfer Aggregate
//!
//! Records the intent and final outcome of moving money between two
//! accounts. The legs themselves are appended to the account streams by the
//! transfer workflow; this stream only tracks the lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{DomainError, DomainEvent, Money, OperationContext, TransferEvent};

use super::{Aggregate, AggregateError};

/// Transfer lifecycle. Every state but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
    Compensated,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    id: Uuid,
    workflow_id: Uuid,
    from_account_id: Uuid,
    to_account_id: Uuid,
    amount: Money,
    description: String,
    status: TransferStatus,
    failure_reason: Option<String>,
    initiated_by: Option<Uuid>,
    initiated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    version: u64,
}

impl Transfer {
    /// Validate and record a new transfer
    pub fn initiate(
        transfer_id: Uuid,
        workflow_id: Uuid,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount: Money,
        description: impl Into<String>,
        ctx: &OperationContext,
    ) -> Result<(Self, TransferEvent), DomainError> {
        if from_account_id == to_account_id {
            return Err(DomainError::SameAccountTransfer);
        }
        if !amount.is_positive() {
            return Err(DomainError::InvalidAmount(
                "transfer amount must be greater than zero".to_string(),
            ));
        }

        let event = TransferEvent::TransferInitiated {
            transfer_id,
            workflow_id,
            from_account_id,
            to_account_id,
            amount,
            description: description.into(),
            initiated_by: ctx.actor_id,
            initiated_at: ctx.occurred_at,
        };

        let transfer = Self::genesis(transfer_id, event.clone())
            .map_err(|e| DomainError::InvalidTransition(e.to_string()))?;
        Ok((transfer, event))
    }

    pub fn complete(&self, ctx: &OperationContext) -> Result<TransferEvent, DomainError> {
        self.ensure_pending("complete")?;
        Ok(TransferEvent::TransferCompleted {
            transfer_id: self.id,
            completed_at: ctx.occurred_at,
        })
    }

    /// First leg failed; nothing moved
    pub fn fail(
        &self,
        reason: impl Into<String>,
        ctx: &OperationContext,
    ) -> Result<TransferEvent, DomainError> {
        self.ensure_pending("fail")?;
        Ok(TransferEvent::TransferFailed {
            transfer_id: self.id,
            reason: reason.into(),
            failed_at: ctx.occurred_at,
        })
    }

    /// A later leg failed and the earlier legs were reversed
    pub fn compensate(
        &self,
        reason: impl Into<String>,
        ctx: &OperationContext,
    ) -> Result<TransferEvent, DomainError> {
        self.ensure_pending("compensate")?;
        Ok(TransferEvent::TransferCompensated {
            transfer_id: self.id,
            reason: reason.into(),
            compensated_at: ctx.occurred_at,
        })
    }

    fn ensure_pending(&self, action: &str) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidTransition(format!(
                "cannot {action} transfer {} in state {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn from_account_id(&self) -> Uuid {
        self.from_account_id
    }

    pub fn to_account_id(&self) -> Uuid {
        self.to_account_id
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn initiated_at(&self) -> DateTime<Utc> {
        self.initiated_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }
}

impl Aggregate for Transfer {
    type Event = TransferEvent;

    fn aggregate_type() -> &'static str {
        "Transfer"
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn genesis(aggregate_id: Uuid, event: TransferEvent) -> Result<Self, AggregateError> {
        match event {
            TransferEvent::TransferInitiated {
                transfer_id,
                workflow_id,
                from_account_id,
                to_account_id,
                amount,
                description,
                initiated_by,
                initiated_at,
            } if transfer_id == aggregate_id => Ok(Self {
                id: transfer_id,
                workflow_id,
                from_account_id,
                to_account_id,
                amount,
                description,
                status: TransferStatus::Pending,
                failure_reason: None,
                initiated_by,
                initiated_at,
                finished_at: None,
                version: 1,
            }),
            other => Err(AggregateError::MissingGenesis {
                aggregate_id,
                found: other.event_type().to_string(),
            }),
        }
    }

    fn apply(mut self, event: TransferEvent) -> Result<Self, AggregateError> {
        if self.status.is_terminal() {
            return Err(AggregateError::invariant(
                self.id,
                format!("{} after terminal state", event.event_type()),
            ));
        }

        match event {
            TransferEvent::TransferInitiated { .. } => {
                return Err(AggregateError::invariant(self.id, "duplicate TransferInitiated"));
            }
            TransferEvent::TransferCompleted { completed_at, .. } => {
                self.status = TransferStatus::Completed;
                self.finished_at = Some(completed_at);
            }
            TransferEvent::TransferFailed {
                reason, failed_at, ..
            } => {
                self.status = TransferStatus::Failed;
                self.failure_reason = Some(reason);
                self.finished_at = Some(failed_at);
            }
            TransferEvent::TransferCompensated {
                reason,
                compensated_at,
                ..
            } => {
                self.status = TransferStatus::Compensated;
                self.failure_reason = Some(reason);
                self.finished_at = Some(compensated_at);
            }
        }

        self.version += 1;
        Ok(self)
    }
}
