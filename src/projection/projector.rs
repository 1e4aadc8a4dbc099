//! Balance projector
//!
//! Folds account events into `BalanceRow` / `TransactionRow`. Each row
//! remembers the last sequence it absorbed, which makes redelivery harmless
//! and exposes gaps.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::aggregate::AccountStatus;
use crate::domain::{AccountEvent, DomainEvent};
use crate::event_store::{EventLog, RecordedEvent};

use super::{BalanceRow, ProjectionError, ProjectionStore, TransactionKind, TransactionRow};

/// What `apply` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already reflected in the projection
    Skipped,
    /// Not an account event
    Ignored,
}

#[derive(Clone)]
pub struct BalanceProjector {
    store: Arc<dyn ProjectionStore>,
}

impl BalanceProjector {
    pub fn new(store: Arc<dyn ProjectionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ProjectionStore> {
        &self.store
    }

    /// Apply one committed event
    pub async fn apply(&self, event: &RecordedEvent) -> Result<ApplyOutcome, ProjectionError> {
        if !AccountEvent::handles(&event.event_type) {
            return Ok(ApplyOutcome::Ignored);
        }

        let aggregate_id = event.aggregate_id;
        let current = self.store.balance(aggregate_id).await?;
        let last_applied = current.as_ref().map(|r| r.last_applied_sequence).unwrap_or(0);

        if event.sequence <= last_applied {
            return Ok(ApplyOutcome::Skipped);
        }
        if event.sequence != last_applied + 1 {
            return Err(ProjectionError::SequenceGap {
                aggregate_id,
                expected: last_applied + 1,
                found: event.sequence,
            });
        }

        let decoded: AccountEvent = event.decode()?;
        let (row, transaction) = project(current, decoded, event)?;

        match self.store.commit(last_applied, row, transaction).await {
            Ok(()) => {
                tracing::trace!(
                    aggregate_id = %aggregate_id,
                    sequence = event.sequence,
                    "Projection updated"
                );
                Ok(ApplyOutcome::Applied)
            }
            Err(ProjectionError::StaleWrite { actual, .. }) if actual >= event.sequence => {
                // A concurrent apply got there first
                Ok(ApplyOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Bring one aggregate's projection up to date from the log.
    /// Returns the number of events applied.
    pub async fn catch_up(
        &self,
        log: &dyn EventLog,
        aggregate_id: Uuid,
    ) -> Result<u64, ProjectionError> {
        let last_applied = self
            .store
            .balance(aggregate_id)
            .await?
            .map(|r| r.last_applied_sequence)
            .unwrap_or(0);

        let mut events = log.read(aggregate_id, last_applied + 1);
        let mut applied = 0;
        while let Some(event) = events.next().await {
            match self.apply(&event?).await? {
                ApplyOutcome::Applied => applied += 1,
                // Not an account stream
                ApplyOutcome::Ignored => break,
                ApplyOutcome::Skipped => {}
            }
        }

        if applied > 0 {
            tracing::debug!(aggregate_id = %aggregate_id, applied, "Projection caught up");
        }
        Ok(applied)
    }

    /// Catch up every stream in the log
    pub async fn catch_up_all(&self, log: &dyn EventLog) -> Result<u64, ProjectionError> {
        let mut applied = 0;
        for aggregate_id in log.aggregate_ids().await? {
            applied += self.catch_up(log, aggregate_id).await?;
        }
        Ok(applied)
    }
}

/// Next row state for one account event
fn project(
    current: Option<BalanceRow>,
    event: AccountEvent,
    recorded: &RecordedEvent,
) -> Result<(BalanceRow, Option<TransactionRow>), ProjectionError> {
    let aggregate_id = recorded.aggregate_id;
    let inconsistent = |reason: &str| ProjectionError::Inconsistent {
        aggregate_id,
        reason: reason.to_string(),
    };

    let mut row = match (current, &event) {
        (None, AccountEvent::AccountCreated { asset_code, .. }) => {
            let row = BalanceRow {
                aggregate_id,
                asset_code: asset_code.clone(),
                balance: 0,
                status: AccountStatus::Active,
                last_applied_sequence: recorded.sequence,
                updated_at: recorded.recorded_at,
            };
            return Ok((row, None));
        }
        (None, _) => return Err(inconsistent("first event is not AccountCreated")),
        (Some(_), AccountEvent::AccountCreated { .. }) => {
            return Err(inconsistent("duplicate AccountCreated"))
        }
        (Some(row), _) => row,
    };

    row.last_applied_sequence = recorded.sequence;
    row.updated_at = recorded.recorded_at;

    let transaction = match event {
        AccountEvent::MoneyAdded {
            amount,
            transfer_id,
            description,
            ..
        } => {
            row.balance = row
                .balance
                .checked_add(amount.amount())
                .ok_or_else(|| inconsistent("balance overflow"))?;
            Some(movement(recorded, TransactionKind::Credit, amount.amount(), &row, transfer_id, description))
        }
        AccountEvent::MoneySubtracted {
            amount,
            transfer_id,
            description,
            ..
        } => {
            row.balance -= amount.amount();
            if row.balance < 0 {
                return Err(inconsistent("negative balance"));
            }
            Some(movement(recorded, TransactionKind::Debit, amount.amount(), &row, transfer_id, description))
        }
        AccountEvent::AccountFrozen { .. } => {
            row.status = AccountStatus::Frozen;
            None
        }
        AccountEvent::AccountUnfrozen { .. } => {
            row.status = AccountStatus::Active;
            None
        }
        AccountEvent::AccountClosed { .. } => {
            row.status = AccountStatus::Closed;
            None
        }
        AccountEvent::AccountCreated { .. } => None,
    };

    Ok((row, transaction))
}

fn movement(
    recorded: &RecordedEvent,
    kind: TransactionKind,
    amount: i64,
    row: &BalanceRow,
    transfer_id: Option<Uuid>,
    description: String,
) -> TransactionRow {
    TransactionRow {
        aggregate_id: recorded.aggregate_id,
        sequence: recorded.sequence,
        kind,
        amount,
        asset_code: row.asset_code.clone(),
        transfer_id,
        description,
        recorded_at: recorded.recorded_at,
    }
}

/// Feeds the projector from the log's subscription
pub struct ProjectorRunner {
    projector: BalanceProjector,
    log: Arc<dyn EventLog>,
}

impl ProjectorRunner {
    pub fn new(projector: BalanceProjector, log: Arc<dyn EventLog>) -> Self {
        Self { projector, log }
    }

    /// Start the runner in the background
    /// Returns a handle that can be used to abort it
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        // Subscribe before the initial catch-up so nothing slips between them
        let receiver = self.log.subscribe();
        tokio::spawn(async move {
            self.run(receiver).await;
        })
    }

    async fn run(&self, mut receiver: tokio::sync::broadcast::Receiver<RecordedEvent>) {
        tracing::info!("Projector started");

        if let Err(e) = self.projector.catch_up_all(self.log.as_ref()).await {
            tracing::error!(error = %e, "Initial projection catch-up failed");
        }

        loop {
            match receiver.recv().await {
                Ok(event) => self.handle(&event).await,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Projector lagged, catching up from the log");
                    if let Err(e) = self.projector.catch_up_all(self.log.as_ref()).await {
                        tracing::error!(error = %e, "Projection catch-up failed");
                    }
                }
                Err(RecvError::Closed) => {
                    tracing::info!("Event bus closed, projector stopping");
                    break;
                }
            }
        }
    }

    async fn handle(&self, event: &RecordedEvent) {
        match self.projector.apply(event).await {
            Ok(_) => {}
            Err(ProjectionError::SequenceGap { aggregate_id, .. }) => {
                if let Err(e) = self.projector.catch_up(self.log.as_ref(), aggregate_id).await {
                    tracing::error!(aggregate_id = %aggregate_id, error = %e, "Projection catch-up failed");
                }
            }
            Err(e) => {
                tracing::error!(
                    aggregate_id = %event.aggregate_id,
                    sequence = event.sequence,
                    error = %e,
                    "Projection failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Account;
    use crate::domain::{AssetCode, Money, OperationContext};
    use crate::event_store::{encode_events, load_stream, InMemoryEventLog};
    use crate::projection::InMemoryProjectionStore;

    fn usd(amount: i64) -> Money {
        Money::new(amount, AssetCode::new("USD").unwrap()).unwrap()
    }

    /// Account with a 5000 deposit and a 1200 withdrawal in the log
    async fn seeded_log() -> (InMemoryEventLog, Uuid) {
        let log = InMemoryEventLog::new();
        let ctx = OperationContext::now();
        let id = Uuid::new_v4();

        let (account, created) = Account::open(id, AssetCode::new("USD").unwrap(), None, &ctx);
        let (account, mut events) = account.deposit(&usd(5000), None, "In", &ctx).unwrap();
        let (_, more) = account.withdraw(&usd(1200), None, "Out", &ctx).unwrap();
        events.insert(0, created);
        events.extend(more);

        log.append(id, 0, encode_events(&events, None).unwrap())
            .await
            .unwrap();
        (log, id)
    }

    fn projector() -> BalanceProjector {
        BalanceProjector::new(Arc::new(InMemoryProjectionStore::new()))
    }

    #[tokio::test]
    async fn test_apply_in_order() {
        let (log, id) = seeded_log().await;
        let projector = projector();

        for event in load_stream(&log, id).await.unwrap() {
            assert_eq!(projector.apply(&event).await.unwrap(), ApplyOutcome::Applied);
        }

        let row = projector.store().balance(id).await.unwrap().unwrap();
        assert_eq!(row.balance, 3800);
        assert_eq!(row.last_applied_sequence, 3);

        let transactions = projector.store().transactions(id, 10, 0).await.unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].kind, TransactionKind::Debit);
        assert_eq!(transactions[1].kind, TransactionKind::Credit);
    }

    #[tokio::test]
    async fn test_redelivery_is_skipped() {
        let (log, id) = seeded_log().await;
        let projector = projector();
        let events = load_stream(&log, id).await.unwrap();

        for event in &events {
            projector.apply(event).await.unwrap();
        }
        let before = projector.store().balance(id).await.unwrap();

        // Deliver event 2 again
        assert_eq!(projector.apply(&events[1]).await.unwrap(), ApplyOutcome::Skipped);
        assert_eq!(projector.store().balance(id).await.unwrap(), before);
        assert_eq!(projector.store().transactions(id, 10, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_gap_then_catch_up() {
        let (log, id) = seeded_log().await;
        let projector = projector();
        let events = load_stream(&log, id).await.unwrap();

        projector.apply(&events[0]).await.unwrap();
        let result = projector.apply(&events[2]).await;
        assert!(matches!(
            result,
            Err(ProjectionError::SequenceGap {
                expected: 2,
                found: 3,
                ..
            })
        ));

        assert_eq!(projector.catch_up(&log, id).await.unwrap(), 2);
        let row = projector.store().balance(id).await.unwrap().unwrap();
        assert_eq!(row.balance, 3800);
    }

    #[tokio::test]
    async fn test_non_account_events_ignored() {
        let projector = projector();
        let event = RecordedEvent {
            aggregate_id: Uuid::new_v4(),
            sequence: 1,
            event_type: "TransferCompleted".to_string(),
            payload: b"{}".to_vec(),
            hash: crate::event_store::EventHash::GENESIS,
            idempotency_key: None,
            recorded_at: chrono::Utc::now(),
        };
        assert_eq!(projector.apply(&event).await.unwrap(), ApplyOutcome::Ignored);
    }
}
