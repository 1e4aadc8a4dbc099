//! Integration tests for the event log: concurrency, idempotency and the
//! hash chain

use futures::TryStreamExt;
use uuid::Uuid;

use finance_core::aggregate::{rehydrate, Account};
use finance_core::domain::{AccountEvent, OperationContext};
use finance_core::event_store::{
    encode_events, load_stream, verify_stream, EventHash, EventLog, EventLogError,
    InMemoryEventLog,
};
use finance_core::handlers::{MovementCommand, OpenAccountCommand};
use finance_core::jobs::audit_hash_chains;

mod common;

use common::{usd, usd_code, Harness, TamperedEventLog};

/// Account with a 5000 deposit: two events in the stream
async fn seeded(log: &dyn EventLog) -> (Uuid, Account) {
    let id = Uuid::new_v4();
    let ctx = OperationContext::now();

    let (account, created) = Account::open(id, usd_code(), None, &ctx);
    log.append(id, 0, encode_events(&[created], None).unwrap())
        .await
        .unwrap();

    let (account, events) = account.deposit(&usd(5_000), None, "seed", &ctx).unwrap();
    log.append(id, 1, encode_events(&events, None).unwrap())
        .await
        .unwrap();

    (id, account)
}

#[tokio::test]
async fn test_append_and_read_in_order() {
    let log = InMemoryEventLog::new();
    let (id, account) = seeded(&log).await;

    let events = load_stream(&log, id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].sequence, 1);
    assert_eq!(events[0].event_type, "AccountCreated");
    assert_eq!(events[1].sequence, 2);
    assert_eq!(events[1].event_type, "MoneyAdded");

    // Each hash covers the previous one
    assert_eq!(events[0].hash, EventHash::compute(&EventHash::GENESIS, &events[0].payload));
    assert_eq!(events[1].hash, EventHash::compute(&events[0].hash, &events[1].payload));

    let replayed: Account = rehydrate(&events).unwrap().unwrap();
    assert_eq!(replayed, account);

    // Reading from the middle of the stream
    let tail: Vec<_> = log.read(id, 2).try_collect().await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].sequence, 2);
}

#[tokio::test]
async fn test_stale_version_conflicts_then_retry_succeeds() {
    let log = InMemoryEventLog::new();
    let (id, _) = seeded(&log).await;
    let ctx = OperationContext::now();

    // Decided against version 1, but the stream is at 2
    let stale: Account = rehydrate(&load_stream(&log, id).await.unwrap()[..1])
        .unwrap()
        .unwrap();
    let (_, events) = stale.deposit(&usd(100), None, "late", &ctx).unwrap();

    let err = log
        .append(id, 1, encode_events(&events, None).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EventLogError::ConcurrencyConflict { expected: 1, actual: 2, .. }
    ));

    // Re-read, decide again, append at the fresh version
    let fresh: Account = rehydrate(&load_stream(&log, id).await.unwrap())
        .unwrap()
        .unwrap();
    let (next, events) = fresh.deposit(&usd(100), None, "late", &ctx).unwrap();
    let version = log
        .append(id, 2, encode_events(&events, None).unwrap())
        .await
        .unwrap();

    assert_eq!(version, 3);
    assert_eq!(next.balance().amount(), 5_100);
    assert!(verify_stream(&log, id).await.unwrap().is_valid);
}

#[tokio::test]
async fn test_idempotency_key_rejects_second_append() {
    let log = InMemoryEventLog::new();
    let (id, account) = seeded(&log).await;
    let key = Uuid::new_v4();
    let ctx = OperationContext::now();

    let (_, events) = account.withdraw(&usd(1_000), None, "fee", &ctx).unwrap();
    log.append(id, 2, encode_events(&events, Some(key)).unwrap())
        .await
        .unwrap();

    // Same key again, even at the right version
    let err = log
        .append(id, 3, encode_events(&events, Some(key)).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EventLogError::DuplicateOperation { sequence: 3, .. }
    ));

    let recorded = log.find_by_idempotency_key(id, key).await.unwrap().unwrap();
    assert_eq!(recorded.sequence, 3);
    let event: AccountEvent = recorded.decode().unwrap();
    assert!(matches!(event, AccountEvent::MoneySubtracted { .. }));
    assert_eq!(log.current_version(id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_append_notifies_subscribers() {
    let log = InMemoryEventLog::new();
    let mut receiver = log.subscribe();

    let (id, _) = seeded(&log).await;

    let first = receiver.recv().await.unwrap();
    let second = receiver.recv().await.unwrap();
    assert_eq!((first.aggregate_id, first.sequence), (id, 1));
    assert_eq!((second.aggregate_id, second.sequence), (id, 2));
}

#[tokio::test]
async fn test_tampered_payload_breaks_the_chain() {
    let inner = InMemoryEventLog::new();
    let (id, _) = seeded(&inner).await;
    let (untouched, _) = seeded(&inner).await;

    let log = TamperedEventLog::new(inner, id, 2);

    let verification = verify_stream(&log, id).await.unwrap();
    assert!(!verification.is_valid);
    assert_eq!(verification.first_invalid_sequence, Some(2));
    assert!(verification.expected_hash.is_some());
    assert_ne!(verification.expected_hash, verification.actual_hash);

    let report = audit_hash_chains(&log).await.unwrap();
    assert_eq!(report.streams_checked, 2);
    assert_eq!(report.broken.len(), 1);
    assert_eq!(report.broken[0].aggregate_id, id);
    assert!(verify_stream(&log, untouched).await.unwrap().is_valid);
}

#[tokio::test]
async fn test_service_streams_verify_end_to_end() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;
    let ctx = OperationContext::now();

    harness
        .accounts
        .withdraw(MovementCommand::new(a, 1_500), &ctx)
        .await
        .unwrap();
    harness
        .accounts
        .deposit(MovementCommand::new(b, 1_500), &ctx)
        .await
        .unwrap();

    let report = audit_hash_chains(harness.log.as_ref()).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.streams_checked, 2);
    assert_eq!(report.events_checked, 5);
}

#[tokio::test]
async fn test_open_account_rejects_second_open() {
    let harness = Harness::new();
    let id = Uuid::new_v4();
    let ctx = OperationContext::now();

    harness
        .accounts
        .open(OpenAccountCommand::new(id, usd_code()), &ctx)
        .await
        .unwrap();
    let err = harness
        .accounts
        .open(OpenAccountCommand::new(id, usd_code()), &ctx)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "account_already_exists");
    assert_eq!(harness.log.current_version(id).await.unwrap(), 1);
}
