//! Workflow steps backed by account commands
//!
//! Every forward command carries the step's idempotency key and every
//! compensation the compensation key, so retries, restarts and probes all
//! resolve to the same appended events.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::handlers::{AccountService, CommandOutcome, MovementCommand, OpenAccountCommand};
use crate::workflow::{StepContext, StepError, WorkflowStep};

fn outcome_value(outcome: &CommandOutcome) -> Result<Value, StepError> {
    serde_json::to_value(outcome).map_err(|e| StepError::rejected("serialization_error", e.to_string()))
}

/// Whether the command keyed by `key` reached the account stream
async fn probe_account(
    accounts: &AccountService,
    account_id: Uuid,
    key: Uuid,
) -> Result<Option<Value>, StepError> {
    let found = accounts
        .log()
        .find_by_idempotency_key(account_id, key)
        .await
        .map_err(AppError::from)?;

    match found {
        Some(_) => {
            let account = accounts.get(account_id).await?;
            Ok(Some(outcome_value(&CommandOutcome::replayed(&account))?))
        }
        None => Ok(None),
    }
}

// =========================================================================
// Open account
// =========================================================================

/// Opens an account; compensation closes it again
pub struct OpenAccountStep {
    accounts: AccountService,
    command: OpenAccountCommand,
}

impl OpenAccountStep {
    pub fn new(accounts: AccountService, command: OpenAccountCommand) -> Self {
        Self { accounts, command }
    }
}

#[async_trait]
impl WorkflowStep for OpenAccountStep {
    fn name(&self) -> &str {
        "open_account"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let outcome = self
            .accounts
            .open(self.command.clone(), &ctx.operation_context())
            .await?;
        outcome_value(&outcome)
    }

    async fn compensate(&self, ctx: &StepContext, _result: Option<&Value>) -> Result<(), StepError> {
        self.accounts
            .close(
                self.command.account_id,
                "account opening rolled back",
                &ctx.compensation_context(),
            )
            .await?;
        Ok(())
    }

    async fn probe(&self, ctx: &StepContext) -> Result<Option<Value>, StepError> {
        probe_account(&self.accounts, self.command.account_id, ctx.idempotency_key()).await
    }
}

// =========================================================================
// Deposit / withdraw
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Movement {
    Deposit,
    Withdraw,
}

/// Credits or debits one account. Compensation applies the opposite
/// movement with the same amount.
pub struct MovementStep {
    name: String,
    movement: Movement,
    accounts: AccountService,
    command: MovementCommand,
}

impl MovementStep {
    pub fn deposit(name: impl Into<String>, accounts: AccountService, command: MovementCommand) -> Self {
        Self {
            name: name.into(),
            movement: Movement::Deposit,
            accounts,
            command,
        }
    }

    pub fn withdraw(name: impl Into<String>, accounts: AccountService, command: MovementCommand) -> Self {
        Self {
            name: name.into(),
            movement: Movement::Withdraw,
            accounts,
            command,
        }
    }

    async fn run(
        &self,
        movement: Movement,
        command: MovementCommand,
        ctx: &crate::domain::OperationContext,
    ) -> Result<CommandOutcome, AppError> {
        match movement {
            Movement::Deposit => self.accounts.deposit(command, ctx).await,
            Movement::Withdraw => self.accounts.withdraw(command, ctx).await,
        }
    }
}

#[async_trait]
impl WorkflowStep for MovementStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let outcome = self
            .run(self.movement, self.command.clone(), &ctx.operation_context())
            .await?;
        outcome_value(&outcome)
    }

    async fn compensate(&self, ctx: &StepContext, _result: Option<&Value>) -> Result<(), StepError> {
        let reverse = match self.movement {
            Movement::Deposit => Movement::Withdraw,
            Movement::Withdraw => Movement::Deposit,
        };
        let description = match &self.command.description {
            Some(description) => format!("Reversal: {description}"),
            None => "Reversal".to_string(),
        };
        let command = self.command.clone().with_description(description);

        let outcome = self
            .run(reverse, command, &ctx.compensation_context())
            .await?;
        tracing::info!(
            workflow_id = %ctx.workflow_id,
            step = %self.name,
            account_id = %outcome.account_id,
            balance = outcome.balance,
            "Movement reversed"
        );
        Ok(())
    }

    async fn probe(&self, ctx: &StepContext) -> Result<Option<Value>, StepError> {
        probe_account(&self.accounts, self.command.account_id, ctx.idempotency_key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssetCode, OperationContext};
    use crate::event_store::InMemoryEventLog;
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use std::sync::Arc;

    async fn funded_account(accounts: &AccountService, amount: i64) -> Uuid {
        let id = Uuid::new_v4();
        accounts
            .open(
                OpenAccountCommand::new(id, AssetCode::new("USD").unwrap()),
                &OperationContext::now(),
            )
            .await
            .unwrap();
        if amount > 0 {
            accounts
                .deposit(MovementCommand::new(id, amount), &OperationContext::now())
                .await
                .unwrap();
        }
        id
    }

    fn accounts() -> AccountService {
        AccountService::new(Arc::new(InMemoryEventLog::new()), RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_withdraw_step_is_idempotent_across_attempts() {
        let accounts = accounts();
        let id = funded_account(&accounts, 1_000).await;
        let step = MovementStep::withdraw("withdraw", accounts.clone(), MovementCommand::new(id, 400));
        let workflow_id = Uuid::new_v4();

        step.execute(&StepContext::new(workflow_id, 0, 1, Utc::now()))
            .await
            .unwrap();
        let replay = step
            .execute(&StepContext::new(workflow_id, 0, 2, Utc::now()))
            .await
            .unwrap();

        assert_eq!(replay["already_applied"], Value::Bool(true));
        assert_eq!(accounts.get(id).await.unwrap().balance().amount(), 600);
    }

    #[tokio::test]
    async fn test_compensation_reverses_once() {
        let accounts = accounts();
        let id = funded_account(&accounts, 1_000).await;
        let step = MovementStep::withdraw("withdraw", accounts.clone(), MovementCommand::new(id, 400));
        let ctx = StepContext::new(Uuid::new_v4(), 0, 1, Utc::now());

        step.execute(&ctx).await.unwrap();
        step.compensate(&ctx, None).await.unwrap();
        step.compensate(&ctx, None).await.unwrap();

        assert_eq!(accounts.get(id).await.unwrap().balance().amount(), 1_000);
    }

    #[tokio::test]
    async fn test_probe_reports_applied_command() {
        let accounts = accounts();
        let id = funded_account(&accounts, 0).await;
        let step = MovementStep::deposit("deposit", accounts.clone(), MovementCommand::new(id, 75));
        let ctx = StepContext::new(Uuid::new_v4(), 1, 1, Utc::now());

        assert!(step.probe(&ctx).await.unwrap().is_none());
        step.execute(&ctx).await.unwrap();
        assert!(step.probe(&ctx).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_domain_failure_surfaces_as_step_error() {
        let accounts = accounts();
        let id = funded_account(&accounts, 10).await;
        let step = MovementStep::withdraw("withdraw", accounts, MovementCommand::new(id, 50));

        let err = step
            .execute(&StepContext::new(Uuid::new_v4(), 0, 1, Utc::now()))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "insufficient_funds");
    }
}
