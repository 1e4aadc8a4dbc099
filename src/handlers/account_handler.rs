//! Account Handler
//!
//! Load → decide → append for every account command. The append is the
//! only serialization point: a lost race re-reads the stream and decides
//! again, with backoff.

use std::sync::Arc;
use uuid::Uuid;

use crate::aggregate::{account::Decision, rehydrate, Account};
use crate::domain::{DomainError, DomainEvent, OperationContext};
use crate::error::{AppError, AppResult};
use crate::event_store::{encode_events, load_stream, EventLog, EventLogError};
use crate::retry::RetryPolicy;

use super::{CommandOutcome, MovementCommand, OpenAccountCommand};

/// Service for account commands
#[derive(Clone)]
pub struct AccountService {
    log: Arc<dyn EventLog>,
    retry: RetryPolicy,
}

impl AccountService {
    pub fn new(log: Arc<dyn EventLog>, retry: RetryPolicy) -> Self {
        Self { log, retry }
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Replay an account. `None` if it was never opened.
    pub async fn load(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        let events = load_stream(self.log.as_ref(), account_id).await?;
        Ok(rehydrate(&events)?)
    }

    pub async fn get(&self, account_id: Uuid) -> AppResult<Account> {
        self.load(account_id)
            .await?
            .ok_or(AppError::Domain(DomainError::AccountNotFound(account_id)))
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub async fn open(
        &self,
        command: OpenAccountCommand,
        ctx: &OperationContext,
    ) -> AppResult<CommandOutcome> {
        let account_id = command.account_id;
        self.execute(account_id, ctx, |state| match state {
            Some(_) => Err(DomainError::AccountAlreadyExists(account_id)),
            None => {
                let (account, event) = Account::open(
                    account_id,
                    command.asset_code.clone(),
                    command.owner_id,
                    ctx,
                );
                Ok((account, vec![event]))
            }
        })
        .await
    }

    pub async fn deposit(
        &self,
        command: MovementCommand,
        ctx: &OperationContext,
    ) -> AppResult<CommandOutcome> {
        let description = command
            .description
            .clone()
            .unwrap_or_else(|| "Deposit".to_string());

        self.execute(command.account_id, ctx, |state| {
            let account = existing(command.account_id, state)?;
            let amount = command.money_for(account)?;
            account.deposit(&amount, command.transfer_id, description.clone(), ctx)
        })
        .await
    }

    pub async fn withdraw(
        &self,
        command: MovementCommand,
        ctx: &OperationContext,
    ) -> AppResult<CommandOutcome> {
        let description = command
            .description
            .clone()
            .unwrap_or_else(|| "Withdrawal".to_string());

        self.execute(command.account_id, ctx, |state| {
            let account = existing(command.account_id, state)?;
            let amount = command.money_for(account)?;
            account.withdraw(&amount, command.transfer_id, description.clone(), ctx)
        })
        .await
    }

    pub async fn freeze(
        &self,
        account_id: Uuid,
        reason: &str,
        ctx: &OperationContext,
    ) -> AppResult<CommandOutcome> {
        self.execute(account_id, ctx, |state| {
            existing(account_id, state)?.freeze(reason, ctx)
        })
        .await
    }

    pub async fn unfreeze(
        &self,
        account_id: Uuid,
        ctx: &OperationContext,
    ) -> AppResult<CommandOutcome> {
        self.execute(account_id, ctx, |state| existing(account_id, state)?.unfreeze(ctx))
            .await
    }

    pub async fn close(
        &self,
        account_id: Uuid,
        reason: &str,
        ctx: &OperationContext,
    ) -> AppResult<CommandOutcome> {
        self.execute(account_id, ctx, |state| {
            existing(account_id, state)?.close(reason, ctx)
        })
        .await
    }

    // =========================================================================
    // Load → decide → append
    // =========================================================================

    async fn execute<F>(
        &self,
        account_id: Uuid,
        ctx: &OperationContext,
        decide: F,
    ) -> AppResult<CommandOutcome>
    where
        F: Fn(Option<&Account>) -> Result<Decision, DomainError> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_execute(account_id, ctx, &decide).await {
                Err(err) if err.is_retryable() && self.retry.should_retry(attempt) => {
                    tracing::debug!(
                        aggregate_id = %account_id,
                        attempt,
                        error = %err,
                        "Account command lost a race, retrying"
                    );
                    self.retry.wait(attempt).await;
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        aggregate_id = %account_id,
                        attempts = attempt,
                        error = %err,
                        "Account command retries exhausted"
                    );
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    async fn try_execute<F>(
        &self,
        account_id: Uuid,
        ctx: &OperationContext,
        decide: &F,
    ) -> AppResult<CommandOutcome>
    where
        F: Fn(Option<&Account>) -> Result<Decision, DomainError> + Send + Sync,
    {
        let events = load_stream(self.log.as_ref(), account_id).await?;
        let current: Option<Account> = rehydrate(&events)?;
        let version = events.last().map(|e| e.sequence).unwrap_or(0);

        if let (Some(key), Some(account)) = (ctx.idempotency_key, current.as_ref()) {
            if events.iter().any(|e| e.idempotency_key == Some(key)) {
                tracing::debug!(aggregate_id = %account_id, idempotency_key = %key, "Command already applied");
                return Ok(CommandOutcome::replayed(account));
            }
        }

        let (next, new_events) = decide(current.as_ref())?;
        if new_events.is_empty() {
            return Ok(CommandOutcome::applied(&next, 0));
        }

        let batch = encode_events(&new_events, ctx.idempotency_key)?;
        match self.log.append(account_id, version, batch).await {
            Ok(new_version) => {
                tracing::info!(
                    aggregate_id = %account_id,
                    version = new_version,
                    events = new_events.len(),
                    event_type = new_events[0].event_type(),
                    "Account events appended"
                );
                Ok(CommandOutcome::applied(&next, new_events.len()))
            }
            // Same key committed by a concurrent attempt
            Err(EventLogError::DuplicateOperation { .. }) => {
                let account = self.get(account_id).await?;
                Ok(CommandOutcome::replayed(&account))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn existing(account_id: Uuid, state: Option<&Account>) -> Result<&Account, DomainError> {
    state.ok_or(DomainError::AccountNotFound(account_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AccountStatus;
    use crate::domain::AssetCode;
    use crate::event_store::InMemoryEventLog;
    use std::time::Duration;

    fn service() -> AccountService {
        AccountService::new(
            Arc::new(InMemoryEventLog::new()),
            RetryPolicy::new(5, Duration::from_millis(1)),
        )
    }

    async fn open(service: &AccountService) -> Uuid {
        let id = Uuid::new_v4();
        service
            .open(
                OpenAccountCommand::new(id, AssetCode::new("USD").unwrap()),
                &OperationContext::now(),
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_deposit_appends_one_event() {
        let service = service();
        let id = open(&service).await;

        let outcome = service
            .deposit(MovementCommand::new(id, 10_000), &OperationContext::now())
            .await
            .unwrap();

        assert_eq!(outcome.balance, 10_000);
        assert_eq!(outcome.events_appended, 1);
        assert_eq!(outcome.version, 2);
        assert_eq!(service.log().current_version(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_funds_appends_nothing() {
        let service = service();
        let id = open(&service).await;
        service
            .deposit(MovementCommand::new(id, 3_000), &OperationContext::now())
            .await
            .unwrap();

        let err = service
            .withdraw(MovementCommand::new(id, 5_000), &OperationContext::now())
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "insufficient_funds");
        assert_eq!(service.get(id).await.unwrap().balance().amount(), 3_000);
        assert_eq!(service.log().current_version(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_idempotency_key_replay() {
        let service = service();
        let id = open(&service).await;
        let ctx = OperationContext::now().with_idempotency_key(Uuid::new_v4());

        let first = service
            .deposit(MovementCommand::new(id, 500), &ctx)
            .await
            .unwrap();
        let second = service
            .deposit(MovementCommand::new(id, 500), &ctx)
            .await
            .unwrap();

        assert!(!first.already_applied);
        assert!(second.already_applied);
        assert_eq!(second.balance, 500);
    }

    #[tokio::test]
    async fn test_freeze_twice_is_noop() {
        let service = service();
        let id = open(&service).await;

        let first = service
            .freeze(id, "review", &OperationContext::now())
            .await
            .unwrap();
        let second = service
            .freeze(id, "review", &OperationContext::now())
            .await
            .unwrap();

        assert_eq!(first.events_appended, 1);
        assert_eq!(second.events_appended, 0);
        assert_eq!(second.status, AccountStatus::Frozen);
        assert_eq!(second.version, first.version);
    }

    #[tokio::test]
    async fn test_open_twice_conflicts() {
        let service = service();
        let id = open(&service).await;

        let err = service
            .open(
                OpenAccountCommand::new(id, AssetCode::new("USD").unwrap()),
                &OperationContext::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "account_already_exists");
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let err = service()
            .deposit(MovementCommand::new(Uuid::new_v4(), 1), &OperationContext::now())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "account_not_found");
    }
}
