//! Read-model rows and storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::aggregate::AccountStatus;
use crate::domain::AssetCode;

use super::ProjectionError;

/// Current balance of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceRow {
    pub aggregate_id: Uuid,
    pub asset_code: AssetCode,
    /// Minor units
    pub balance: i64,
    pub status: AccountStatus,
    /// Highest stream sequence folded into this row
    pub last_applied_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Credit,
    Debit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "credit",
            TransactionKind::Debit => "debit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(TransactionKind::Credit),
            "debit" => Some(TransactionKind::Debit),
            _ => None,
        }
    }
}

/// One balance movement, keyed by `(aggregate_id, sequence)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRow {
    pub aggregate_id: Uuid,
    pub sequence: u64,
    pub kind: TransactionKind,
    pub amount: i64,
    pub asset_code: AssetCode,
    pub transfer_id: Option<Uuid>,
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

/// Storage for the account read models
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn balance(&self, aggregate_id: Uuid) -> Result<Option<BalanceRow>, ProjectionError>;

    /// Most recent first
    async fn transactions(
        &self,
        aggregate_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionRow>, ProjectionError>;

    /// Store `row` (and the movement it came from) only if the stored row is
    /// still at `expected_sequence` (0 when absent).
    async fn commit(
        &self,
        expected_sequence: u64,
        row: BalanceRow,
        transaction: Option<TransactionRow>,
    ) -> Result<(), ProjectionError>;
}

#[derive(Debug, Default)]
struct Tables {
    balances: HashMap<Uuid, BalanceRow>,
    transactions: HashMap<Uuid, Vec<TransactionRow>>,
}

/// Read models held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryProjectionStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn balance(&self, aggregate_id: Uuid) -> Result<Option<BalanceRow>, ProjectionError> {
        Ok(self.tables.read().await.balances.get(&aggregate_id).cloned())
    }

    async fn transactions(
        &self,
        aggregate_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionRow>, ProjectionError> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .get(&aggregate_id)
            .map(|rows| rows.iter().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        expected_sequence: u64,
        row: BalanceRow,
        transaction: Option<TransactionRow>,
    ) -> Result<(), ProjectionError> {
        let mut tables = self.tables.write().await;

        let actual = tables
            .balances
            .get(&row.aggregate_id)
            .map(|r| r.last_applied_sequence)
            .unwrap_or(0);
        if actual != expected_sequence {
            return Err(ProjectionError::StaleWrite {
                aggregate_id: row.aggregate_id,
                expected: expected_sequence,
                actual,
            });
        }

        if let Some(transaction) = transaction {
            tables
                .transactions
                .entry(transaction.aggregate_id)
                .or_default()
                .push(transaction);
        }
        tables.balances.insert(row.aggregate_id, row);
        Ok(())
    }
}
