//! Common test utilities
//!
//! Wires the services over in-memory backends, plus event log wrappers that
//! simulate outages and tampering.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use uuid::Uuid;

use finance_core::api::{self, AppState};
use finance_core::connectors::{CustodianRegistry, MockCustodian, StaticAssetRegistry};
use finance_core::domain::{AssetCode, Money, OperationContext};
use finance_core::event_store::{
    EventLog, EventLogError, InMemoryEventLog, NewEvent, RecordedEvent,
};
use finance_core::handlers::{AccountService, MovementCommand, OpenAccountCommand, TransferService};
use finance_core::jobs::JobContext;
use finance_core::projection::{BalanceProjector, InMemoryProjectionStore};
use finance_core::retry::RetryPolicy;
use finance_core::workflow::{EngineConfig, InMemoryWorkflowRepository, WorkflowEngine};
use finance_core::workflows::WorkflowCatalog;

pub const CUSTODIAN: &str = "acme";

pub fn usd_code() -> AssetCode {
    AssetCode::new("USD").unwrap()
}

pub fn usd(amount: i64) -> Money {
    Money::new(amount, usd_code()).unwrap()
}

/// Fast retries so failure paths finish quickly
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        step_timeout: Duration::from_secs(2),
        step_retry: RetryPolicy::new(3, Duration::from_millis(1)),
        compensation_retry: RetryPolicy::new(6, Duration::from_millis(1)),
        workers: 4,
    }
}

/// Every service wired over in-memory storage
#[derive(Clone)]
pub struct Harness {
    pub log: Arc<dyn EventLog>,
    pub accounts: AccountService,
    pub engine: WorkflowEngine,
    pub workflows: Arc<InMemoryWorkflowRepository>,
    pub transfers: TransferService,
    pub catalog: WorkflowCatalog,
    pub custodian: MockCustodian,
    pub projections: Arc<InMemoryProjectionStore>,
    pub projector: BalanceProjector,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_log(Arc::new(InMemoryEventLog::new()))
    }

    pub fn with_log(log: Arc<dyn EventLog>) -> Self {
        let workflows = Arc::new(InMemoryWorkflowRepository::new());
        Self::build(log, workflows)
    }

    /// Same storage, fresh services: what a restarted process sees
    pub fn restarted(&self) -> Self {
        let mut harness = Self::build(Arc::clone(&self.log), Arc::clone(&self.workflows));
        harness.custodian = self.custodian.clone();
        harness.catalog = WorkflowCatalog::new(
            harness.accounts.clone(),
            CustodianRegistry::new().register(Arc::new(self.custodian.clone())),
        );
        harness
    }

    fn build(log: Arc<dyn EventLog>, workflows: Arc<InMemoryWorkflowRepository>) -> Self {
        let accounts = AccountService::new(
            Arc::clone(&log),
            RetryPolicy::new(10, Duration::from_millis(1)),
        );
        let engine = WorkflowEngine::new(workflows.clone(), test_engine_config());
        let custodian = MockCustodian::new(CUSTODIAN);
        let catalog = WorkflowCatalog::new(
            accounts.clone(),
            CustodianRegistry::new().register(Arc::new(custodian.clone())),
        );
        let projections = Arc::new(InMemoryProjectionStore::new());

        Self {
            transfers: TransferService::new(accounts.clone(), engine.clone()),
            projector: BalanceProjector::new(projections.clone()),
            log,
            accounts,
            engine,
            workflows,
            catalog,
            custodian,
            projections,
        }
    }

    /// Open a USD account holding `balance`
    pub async fn open_funded(&self, balance: i64) -> Uuid {
        let id = Uuid::new_v4();
        let ctx = OperationContext::now();
        self.accounts
            .open(OpenAccountCommand::new(id, usd_code()), &ctx)
            .await
            .unwrap();
        if balance > 0 {
            self.accounts
                .deposit(MovementCommand::new(id, balance), &ctx)
                .await
                .unwrap();
        }
        id
    }

    pub async fn balance(&self, account_id: Uuid) -> i64 {
        self.accounts.get(account_id).await.unwrap().balance().amount()
    }

    pub fn job_context(&self) -> JobContext {
        JobContext {
            log: Arc::clone(&self.log),
            engine: self.engine.clone(),
            catalog: self.catalog.clone(),
            transfers: self.transfers.clone(),
            projector: self.projector.clone(),
        }
    }

    pub fn router(&self) -> axum::Router {
        api::create_router(AppState {
            accounts: self.accounts.clone(),
            transfers: self.transfers.clone(),
            engine: self.engine.clone(),
            catalog: self.catalog.clone(),
            projections: self.projections.clone(),
            assets: Arc::new(StaticAssetRegistry::default()),
        })
    }
}

// =========================================================================
// Event log doubles
// =========================================================================

/// Fails the first `failures` appends with `Unavailable`
pub struct FlakyEventLog {
    inner: InMemoryEventLog,
    remaining: AtomicU32,
}

impl FlakyEventLog {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryEventLog::new(),
            remaining: AtomicU32::new(failures),
        }
    }

    pub fn fail_next(&self, failures: u32) {
        self.remaining.store(failures, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventLog for FlakyEventLog {
    async fn append(
        &self,
        aggregate_id: Uuid,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError> {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EventLogError::Unavailable("simulated outage".to_string()));
        }
        self.inner.append(aggregate_id, expected_version, events).await
    }

    fn read(
        &self,
        aggregate_id: Uuid,
        from_sequence: u64,
    ) -> BoxStream<'static, Result<RecordedEvent, EventLogError>> {
        self.inner.read(aggregate_id, from_sequence)
    }

    async fn current_version(&self, aggregate_id: Uuid) -> Result<u64, EventLogError> {
        self.inner.current_version(aggregate_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        aggregate_id: Uuid,
        key: Uuid,
    ) -> Result<Option<RecordedEvent>, EventLogError> {
        self.inner.find_by_idempotency_key(aggregate_id, key).await
    }

    async fn aggregate_ids(&self) -> Result<Vec<Uuid>, EventLogError> {
        self.inner.aggregate_ids().await
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordedEvent> {
        self.inner.subscribe()
    }
}

/// Serves one event with its stored payload altered, as if the row had
/// been edited behind the log's back
pub struct TamperedEventLog {
    inner: InMemoryEventLog,
    target: (Uuid, u64),
}

impl TamperedEventLog {
    pub fn new(inner: InMemoryEventLog, aggregate_id: Uuid, sequence: u64) -> Self {
        Self {
            inner,
            target: (aggregate_id, sequence),
        }
    }
}

#[async_trait]
impl EventLog for TamperedEventLog {
    async fn append(
        &self,
        aggregate_id: Uuid,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError> {
        self.inner.append(aggregate_id, expected_version, events).await
    }

    fn read(
        &self,
        aggregate_id: Uuid,
        from_sequence: u64,
    ) -> BoxStream<'static, Result<RecordedEvent, EventLogError>> {
        let target = self.target;
        self.inner
            .read(aggregate_id, from_sequence)
            .map(move |item| {
                item.map(|mut event| {
                    if (event.aggregate_id, event.sequence) == target {
                        event.payload = event
                            .payload
                            .iter()
                            .map(|b| if *b == b'0' { b'9' } else { *b })
                            .collect();
                    }
                    event
                })
            })
            .boxed()
    }

    async fn current_version(&self, aggregate_id: Uuid) -> Result<u64, EventLogError> {
        self.inner.current_version(aggregate_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        aggregate_id: Uuid,
        key: Uuid,
    ) -> Result<Option<RecordedEvent>, EventLogError> {
        self.inner.find_by_idempotency_key(aggregate_id, key).await
    }

    async fn aggregate_ids(&self) -> Result<Vec<Uuid>, EventLogError> {
        self.inner.aggregate_ids().await
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordedEvent> {
        self.inner.subscribe()
    }
}
