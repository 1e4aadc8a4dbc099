//! Custodian connectors
//!
//! External custodians hold the real-world side of an account (bank,
//! exchange, wallet provider). Workflows move money through them with a
//! caller-chosen reference that makes every transfer request idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{AssetCode, Money};
use crate::workflow::StepError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CustodianError {
    #[error("Custodian unavailable: {0}")]
    Unavailable(String),

    #[error("Custodian rejected the request: {status}")]
    Rejected { status: String },

    #[error("Custodian timed out")]
    Timeout,
}

impl From<CustodianError> for StepError {
    fn from(err: CustodianError) -> Self {
        match err {
            CustodianError::Unavailable(msg) => StepError::Infrastructure(msg),
            CustodianError::Timeout => StepError::Infrastructure("custodian timed out".to_string()),
            CustodianError::Rejected { status } => {
                StepError::rejected("custodian_rejected", status)
            }
        }
    }
}

/// Which way the money moves, seen from the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Ledger → external account
    Outgoing,
    /// External account → ledger
    Incoming,
}

impl TransferDirection {
    pub fn reversed(self) -> Self {
        match self {
            TransferDirection::Outgoing => TransferDirection::Incoming,
            TransferDirection::Incoming => TransferDirection::Outgoing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianTransferRequest {
    /// Idempotency reference; resubmitting it returns the original receipt
    pub reference: Uuid,
    pub external_account: String,
    pub amount: Money,
    pub direction: TransferDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub reference: Uuid,
    /// Custodian's own transaction id
    pub custodian_reference: String,
    pub amount: Money,
    pub direction: TransferDirection,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait CustodianConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn get_balance(&self, account: &str, asset: &AssetCode) -> Result<Money, CustodianError>;

    async fn transfer(&self, request: &CustodianTransferRequest) -> Result<Receipt, CustodianError>;

    async fn is_available(&self) -> bool;

    /// Look up an earlier transfer by reference
    async fn find_transfer(&self, _reference: Uuid) -> Result<Option<Receipt>, CustodianError> {
        Ok(None)
    }
}

/// Connectors by name
#[derive(Clone, Default)]
pub struct CustodianRegistry {
    connectors: HashMap<String, Arc<dyn CustodianConnector>>,
}

impl CustodianRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, connector: Arc<dyn CustodianConnector>) -> Self {
        self.connectors
            .insert(connector.name().to_string(), connector);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CustodianConnector>> {
        self.connectors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CustodianRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodianRegistry")
            .field("connectors", &self.names())
            .finish()
    }
}

// =========================================================================
// Mock custodian
// =========================================================================

#[derive(Debug, Default)]
struct MockState {
    balances: HashMap<(String, AssetCode), i64>,
    receipts: HashMap<Uuid, Receipt>,
    failures: VecDeque<CustodianError>,
    available: bool,
}

/// In-process custodian for development and tests
#[derive(Debug, Clone)]
pub struct MockCustodian {
    name: String,
    state: Arc<Mutex<MockState>>,
    delay: Option<Duration>,
}

impl MockCustodian {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState {
                available: true,
                ..MockState::default()
            })),
            delay: None,
        }
    }

    /// Delay every transfer, to exercise step timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn set_balance(&self, account: &str, money: &Money) {
        self.state.lock().await.balances.insert(
            (account.to_string(), money.asset_code().clone()),
            money.amount(),
        );
    }

    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    /// Fail the next transfer call with `err`
    pub async fn fail_next(&self, err: CustodianError) {
        self.state.lock().await.failures.push_back(err);
    }

    /// Distinct transfers processed
    pub async fn transfer_count(&self) -> usize {
        self.state.lock().await.receipts.len()
    }
}

#[async_trait]
impl CustodianConnector for MockCustodian {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_balance(&self, account: &str, asset: &AssetCode) -> Result<Money, CustodianError> {
        let state = self.state.lock().await;
        if !state.available {
            return Err(CustodianError::Unavailable(self.name.clone()));
        }
        let amount = state
            .balances
            .get(&(account.to_string(), asset.clone()))
            .copied()
            .unwrap_or(0);
        Money::new(amount, asset.clone()).map_err(|e| CustodianError::Rejected {
            status: e.to_string(),
        })
    }

    async fn transfer(&self, request: &CustodianTransferRequest) -> Result<Receipt, CustodianError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if !state.available {
            return Err(CustodianError::Unavailable(self.name.clone()));
        }
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if let Some(receipt) = state.receipts.get(&request.reference) {
            return Ok(receipt.clone());
        }

        let key = (
            request.external_account.clone(),
            request.amount.asset_code().clone(),
        );
        let balance = state.balances.get(&key).copied().unwrap_or(0);
        let updated = match request.direction {
            TransferDirection::Outgoing => balance.checked_add(request.amount.amount()),
            TransferDirection::Incoming if balance >= request.amount.amount() => {
                balance.checked_sub(request.amount.amount())
            }
            TransferDirection::Incoming => None,
        }
        .ok_or_else(|| CustodianError::Rejected {
            status: "insufficient_funds".to_string(),
        })?;
        state.balances.insert(key, updated);

        let receipt = Receipt {
            reference: request.reference,
            custodian_reference: format!("{}-{}", self.name, state.receipts.len() + 1),
            amount: request.amount.clone(),
            direction: request.direction,
            processed_at: Utc::now(),
        };
        state.receipts.insert(request.reference, receipt.clone());

        tracing::debug!(
            custodian = %self.name,
            reference = %request.reference,
            direction = ?request.direction,
            amount = %request.amount,
            "Custodian transfer processed"
        );
        Ok(receipt)
    }

    async fn is_available(&self) -> bool {
        self.state.lock().await.available
    }

    async fn find_transfer(&self, reference: Uuid) -> Result<Option<Receipt>, CustodianError> {
        Ok(self.state.lock().await.receipts.get(&reference).cloned())
    }
}
