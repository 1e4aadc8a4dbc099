//! Integration tests for sagas: compensation, crash recovery, cancellation,
//! custodians, batches and concurrent commands

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use finance_core::aggregate::{Transfer, TransferStatus};
use finance_core::connectors::{CustodianError, TransferDirection};
use finance_core::domain::OperationContext;
use finance_core::event_store::{encode_events, EventLog};
use finance_core::handlers::{MovementCommand, TransferCommand};
use finance_core::jobs::{self, JobScheduler, JobSchedulerConfig};
use finance_core::projection::{ProjectionStore, ProjectorRunner};
use finance_core::workflow::{
    StepContext, StepError, StepStatus, WorkflowDefinition, WorkflowExecution, WorkflowRepository,
    WorkflowStatus, WorkflowStep,
};
use finance_core::workflows::{
    BatchInput, BatchProcessingWorkflow, CustodianTransferInput, CustodianTransferWorkflow,
    MovementStep, Posting, TransferInput, TransferWorkflow,
};

mod common;

use common::{usd, FlakyEventLog, Harness, CUSTODIAN};

/// Credit leg that always fails
struct RejectingCredit;

#[async_trait]
impl WorkflowStep for RejectingCredit {
    fn name(&self) -> &str {
        "credit"
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<Value, StepError> {
        Err(StepError::rejected("credit_rejected", "simulated credit failure"))
    }
}

fn transfer_input(from: Uuid, to: Uuid, amount: i64) -> TransferInput {
    TransferInput {
        transfer_id: Uuid::new_v4(),
        from_account_id: from,
        to_account_id: to,
        amount: usd(amount),
        description: "Invoice 42".to_string(),
    }
}

fn step_statuses(execution: &WorkflowExecution) -> Vec<StepStatus> {
    execution.steps.iter().map(|s| s.status).collect()
}

// =========================================================================
// Compensation
// =========================================================================

#[tokio::test]
async fn test_failed_credit_reverses_debit() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;

    let definition = WorkflowDefinition::new("transfer", json!({ "from": a, "to": b }))
        .step(MovementStep::withdraw(
            "withdraw",
            harness.accounts.clone(),
            MovementCommand::new(a, 2_000).with_description("Transfer"),
        ))
        .step(RejectingCredit);

    let execution = harness.engine.start(Uuid::new_v4(), definition).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Compensated);
    assert_eq!(
        step_statuses(&execution),
        vec![StepStatus::Compensated, StepStatus::Failed]
    );
    assert_eq!(execution.steps[1].error_code.as_deref(), Some("credit_rejected"));
    assert_eq!(harness.balance(a).await, 5_000);
    assert_eq!(harness.balance(b).await, 0);
}

#[tokio::test]
async fn test_transfer_into_frozen_account_is_compensated() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;
    let ctx = OperationContext::now();
    harness.accounts.freeze(b, "kyc review", &ctx).await.unwrap();

    let result = harness
        .transfers
        .execute(TransferCommand::new(a, b, 2_000), &ctx)
        .await
        .unwrap();

    assert_eq!(result.status, TransferStatus::Compensated);
    assert!(result.failure_reason.unwrap().contains("deposit"));
    assert_eq!(harness.balance(a).await, 5_000);
    assert_eq!(harness.balance(b).await, 0);

    let execution = harness.engine.get(result.workflow_id).await.unwrap().unwrap();
    assert_eq!(execution.status, WorkflowStatus::Compensated);
    assert_eq!(execution.steps[1].error_code.as_deref(), Some("account_frozen"));

    // Debit and reversal both stay in A's history
    assert_eq!(harness.log.current_version(a).await.unwrap(), 4);
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_overdraws_never_go_negative() {
    let harness = Harness::new();
    let a = harness.open_funded(1_000).await;

    let attempts: Vec<_> = (0..2)
        .map(|_| {
            let accounts = harness.accounts.clone();
            tokio::spawn(async move {
                accounts
                    .withdraw(MovementCommand::new(a, 700), &OperationContext::now())
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => assert!(
                ["insufficient_funds", "concurrency_conflict"].contains(&err.error_code()),
                "unexpected error {err}"
            ),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(harness.balance(a).await, 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_transfers_conserve_money() {
    let harness = Harness::new();
    let a = harness.open_funded(10_000).await;
    let b = harness.open_funded(10_000).await;

    let transfers: Vec<_> = (0..6)
        .map(|i| {
            let service = harness.transfers.clone();
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            tokio::spawn(async move {
                service
                    .execute(TransferCommand::new(from, to, 100 + i), &OperationContext::now())
                    .await
            })
        })
        .collect();

    for transfer in transfers {
        let result = transfer.await.unwrap().unwrap();
        assert_eq!(result.status, TransferStatus::Completed);
    }

    assert_eq!(harness.balance(a).await + harness.balance(b).await, 20_000);
}

#[tokio::test]
async fn test_transient_log_outage_is_retried() {
    let log = Arc::new(FlakyEventLog::new(0));
    let harness = Harness::with_log(log.clone());
    let a = harness.open_funded(1_000).await;

    log.fail_next(3);
    let outcome = harness
        .accounts
        .deposit(MovementCommand::new(a, 250), &OperationContext::now())
        .await
        .unwrap();

    assert_eq!(outcome.balance, 1_250);
    assert_eq!(outcome.events_appended, 1);
    assert_eq!(harness.log.current_version(a).await.unwrap(), 3);
}

// =========================================================================
// Recovery
// =========================================================================

/// Append `TransferInitiated` only, as `TransferService::execute` does
/// before starting the workflow
async fn initiated(harness: &Harness, input: &TransferInput) {
    let (_, event) = Transfer::initiate(
        input.transfer_id,
        input.transfer_id,
        input.from_account_id,
        input.to_account_id,
        input.amount.clone(),
        input.description.clone(),
        &OperationContext::now(),
    )
    .unwrap();
    harness
        .log
        .append(input.transfer_id, 0, encode_events(&[event], None).unwrap())
        .await
        .unwrap();
}

/// Persist a transfer and its execution as if the process died after the
/// debit was appended but before the step was marked done
async fn crashed_after_debit(harness: &Harness, a: Uuid, b: Uuid, amount: i64) -> Uuid {
    let input = transfer_input(a, b, amount);
    let transfer_id = input.transfer_id;
    initiated(harness, &input).await;

    let definition = TransferWorkflow::definition(&harness.accounts, &input).unwrap();
    let mut execution = WorkflowExecution::new(
        transfer_id,
        definition.workflow_type(),
        definition.input().clone(),
        definition.step_names(),
        Utc::now(),
    );
    // The engine records the attempt before running the step
    execution.steps[0].attempts = 1;
    assert!(harness.workflows.create(&execution).await.unwrap());

    let step = StepContext::new(transfer_id, 0, 1, Utc::now());
    harness
        .accounts
        .withdraw(
            MovementCommand::new(a, amount).with_transfer(transfer_id),
            &step.operation_context(),
        )
        .await
        .unwrap();

    transfer_id
}

#[tokio::test]
async fn test_recovery_finishes_without_double_debit() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;
    let transfer_id = crashed_after_debit(&harness, a, b, 2_000).await;
    assert_eq!(harness.balance(a).await, 3_000);

    let restarted = harness.restarted();
    let report = jobs::recover_workflows(&restarted.job_context()).await.unwrap();

    assert_eq!(report.examined, 1);
    assert_eq!(report.resumed, 1);
    assert_eq!(harness.balance(a).await, 3_000);
    assert_eq!(harness.balance(b).await, 2_000);

    let transfer = restarted.transfers.get(transfer_id).await.unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);

    // Nothing left to do on the next sweep
    let report = jobs::recover_workflows(&restarted.job_context()).await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn test_recovery_records_outcome_of_finished_workflow() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;
    let input = transfer_input(a, b, 2_000);
    initiated(&harness, &input).await;

    // Workflow ran to the end, then the process died before the outcome event
    let definition = TransferWorkflow::definition(&harness.accounts, &input).unwrap();
    let execution = harness.engine.start(input.transfer_id, definition).await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);

    let restarted = harness.restarted();
    let report = jobs::recover_workflows(&restarted.job_context()).await.unwrap();

    assert_eq!(report.examined, 0);
    assert_eq!(report.transfers_settled, 1);
    let transfer = restarted.transfers.get(input.transfer_id).await.unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(harness.balance(a).await, 3_000);
    assert_eq!(harness.balance(b).await, 2_000);

    let report = jobs::recover_workflows(&restarted.job_context()).await.unwrap();
    assert_eq!(report.transfers_settled, 0);
}

#[tokio::test]
async fn test_recovery_starts_transfer_that_never_got_a_workflow() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;
    let input = transfer_input(a, b, 1_000);
    initiated(&harness, &input).await;
    assert!(harness.engine.get(input.transfer_id).await.unwrap().is_none());

    let restarted = harness.restarted();
    let report = jobs::recover_workflows(&restarted.job_context()).await.unwrap();

    assert_eq!(report.transfers_settled, 1);
    let transfer = restarted.transfers.get(input.transfer_id).await.unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(harness.balance(a).await, 4_000);
    assert_eq!(harness.balance(b).await, 1_000);
}

#[tokio::test]
async fn test_resubmitted_transfer_resumes_pending_workflow() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;
    let transfer_id = crashed_after_debit(&harness, a, b, 1_500).await;

    let result = harness
        .restarted()
        .transfers
        .execute(
            TransferCommand::new(a, b, 1_500).with_id(transfer_id),
            &OperationContext::now(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(harness.balance(a).await, 3_500);
    assert_eq!(harness.balance(b).await, 1_500);
}

#[tokio::test]
async fn test_cancelled_transfer_is_compensated_on_recovery() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;
    let transfer_id = crashed_after_debit(&harness, a, b, 2_000).await;

    let cancelled = harness.engine.cancel(transfer_id).await.unwrap();
    assert!(cancelled.cancel_requested);

    let restarted = harness.restarted();
    jobs::recover_workflows(&restarted.job_context()).await.unwrap();

    let execution = harness.engine.get(transfer_id).await.unwrap().unwrap();
    assert_eq!(execution.status, WorkflowStatus::Compensated);
    assert_eq!(execution.error.as_deref(), Some("cancelled"));

    // The debit that reached the log before the crash was reversed
    assert_eq!(harness.balance(a).await, 5_000);
    assert_eq!(harness.balance(b).await, 0);
}

// =========================================================================
// Custodians
// =========================================================================

fn custodian_input(account_id: Uuid, amount: i64, direction: TransferDirection) -> CustodianTransferInput {
    CustodianTransferInput {
        transfer_id: Uuid::new_v4(),
        account_id,
        custodian: CUSTODIAN.to_string(),
        external_account: "ext-001".to_string(),
        amount: usd(amount),
        direction,
    }
}

#[tokio::test]
async fn test_outgoing_custodian_transfer() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    let input = custodian_input(a, 2_000, TransferDirection::Outgoing);

    let definition =
        CustodianTransferWorkflow::definition(&harness.accounts, harness.catalog.custodians(), &input)
            .unwrap();
    let execution = harness.engine.start(input.transfer_id, definition).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(harness.balance(a).await, 3_000);
    assert_eq!(harness.custodian.transfer_count().await, 1);
    assert!(execution.step_result("custodian_push").is_some());
}

#[tokio::test]
async fn test_custodian_rejection_returns_funds() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    harness
        .custodian
        .fail_next(CustodianError::Rejected {
            status: "account_blocked".to_string(),
        })
        .await;

    let input = custodian_input(a, 2_000, TransferDirection::Outgoing);
    let definition =
        CustodianTransferWorkflow::definition(&harness.accounts, harness.catalog.custodians(), &input)
            .unwrap();
    let execution = harness.engine.start(input.transfer_id, definition).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Compensated);
    assert_eq!(
        step_statuses(&execution),
        vec![StepStatus::Done, StepStatus::Compensated, StepStatus::Failed]
    );
    assert_eq!(execution.steps[2].error_code.as_deref(), Some("custodian_rejected"));
    assert_eq!(harness.balance(a).await, 5_000);
}

#[tokio::test]
async fn test_custodian_outage_is_retried() {
    let harness = Harness::new();
    let a = harness.open_funded(0).await;
    harness.custodian.set_balance("ext-001", &usd(9_000)).await;
    harness
        .custodian
        .fail_next(CustodianError::Unavailable("maintenance".to_string()))
        .await;

    let input = custodian_input(a, 4_000, TransferDirection::Incoming);
    let definition =
        CustodianTransferWorkflow::definition(&harness.accounts, harness.catalog.custodians(), &input)
            .unwrap();
    let execution = harness.engine.start(input.transfer_id, definition).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.steps[1].attempts, 2);
    assert_eq!(harness.balance(a).await, 4_000);
}

// =========================================================================
// Batches
// =========================================================================

#[tokio::test]
async fn test_batch_failure_reverses_earlier_postings_newest_first() {
    let harness = Harness::new();
    let a = harness.open_funded(1_000).await;
    let b = harness.open_funded(0).await;

    let input = BatchInput {
        batch_id: Uuid::new_v4(),
        postings: vec![
            Posting::Credit {
                account_id: b,
                amount: usd(500),
            },
            Posting::Transfer {
                from_account_id: a,
                to_account_id: b,
                amount: usd(300),
            },
            Posting::Debit {
                account_id: a,
                amount: usd(5_000),
            },
        ],
    };

    let definition = BatchProcessingWorkflow::definition(&harness.accounts, &input).unwrap();
    let execution = harness.engine.start(input.batch_id, definition).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Compensated);
    assert_eq!(
        step_statuses(&execution),
        vec![
            StepStatus::Compensated,
            StepStatus::Compensated,
            StepStatus::Compensated,
            StepStatus::Failed,
        ]
    );
    assert_eq!(execution.steps[3].error_code.as_deref(), Some("insufficient_funds"));
    assert_eq!(harness.balance(a).await, 1_000);
    assert_eq!(harness.balance(b).await, 0);
}

#[tokio::test]
async fn test_batch_applies_all_postings() {
    let harness = Harness::new();
    let a = harness.open_funded(1_000).await;
    let b = harness.open_funded(0).await;

    let input = BatchInput {
        batch_id: Uuid::new_v4(),
        postings: vec![
            Posting::Credit {
                account_id: a,
                amount: usd(200),
            },
            Posting::Transfer {
                from_account_id: a,
                to_account_id: b,
                amount: usd(1_100),
            },
        ],
    };

    let definition = BatchProcessingWorkflow::definition(&harness.accounts, &input).unwrap();
    let execution = harness.engine.start(input.batch_id, definition).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(harness.balance(a).await, 100);
    assert_eq!(harness.balance(b).await, 1_100);
}

// =========================================================================
// Projections
// =========================================================================

#[tokio::test]
async fn test_projector_follows_the_log() {
    let harness = Harness::new();
    let runner = ProjectorRunner::new(harness.projector.clone(), Arc::clone(&harness.log)).start();

    let a = harness.open_funded(5_000).await;
    let b = harness.open_funded(0).await;
    harness
        .transfers
        .execute(TransferCommand::new(a, b, 1_200), &OperationContext::now())
        .await
        .unwrap();

    let mut projected = None;
    for _ in 0..100 {
        let row = harness.projections.balance(b).await.unwrap();
        if row.as_ref().map(|r| r.balance) == Some(1_200) {
            projected = row;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    runner.abort();

    let row = projected.expect("projection never caught up");
    assert_eq!(row.last_applied_sequence, 2);

    let history = harness.projections.transactions(b, 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].transfer_id.is_some());
}

#[tokio::test]
async fn test_maintenance_run_rebuilds_projections() {
    let harness = Harness::new();
    let a = harness.open_funded(5_000).await;
    harness
        .accounts
        .withdraw(MovementCommand::new(a, 800), &OperationContext::now())
        .await
        .unwrap();

    let scheduler = JobScheduler::new(harness.job_context(), JobSchedulerConfig::default());
    let report = scheduler.run_all_once().await;

    assert!(report.errors.is_empty());
    assert_eq!(report.projection_events_applied, 3);
    assert_eq!(report.broken_chains, 0);

    let row = harness.projections.balance(a).await.unwrap().unwrap();
    assert_eq!(row.balance, 4_200);
    assert_eq!(harness.projections.transactions(a, 10, 0).await.unwrap().len(), 2);
}
