//! PostgreSQL read models (`account_balances`, `account_transactions`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::aggregate::AccountStatus;
use crate::domain::AssetCode;

use super::{BalanceRow, ProjectionError, ProjectionStore, TransactionKind, TransactionRow};

fn parse_status(aggregate_id: Uuid, status: &str) -> Result<AccountStatus, ProjectionError> {
    match status {
        "active" => Ok(AccountStatus::Active),
        "frozen" => Ok(AccountStatus::Frozen),
        "closed" => Ok(AccountStatus::Closed),
        other => Err(ProjectionError::Inconsistent {
            aggregate_id,
            reason: format!("unknown status {other:?}"),
        }),
    }
}

fn parse_asset(aggregate_id: Uuid, code: String) -> Result<AssetCode, ProjectionError> {
    AssetCode::new(code).map_err(|e| ProjectionError::Inconsistent {
        aggregate_id,
        reason: e.to_string(),
    })
}

fn to_u64(aggregate_id: Uuid, value: i64) -> Result<u64, ProjectionError> {
    u64::try_from(value).map_err(|_| ProjectionError::Inconsistent {
        aggregate_id,
        reason: format!("negative sequence {value}"),
    })
}

fn to_i64(aggregate_id: Uuid, value: u64) -> Result<i64, ProjectionError> {
    i64::try_from(value).map_err(|_| ProjectionError::Inconsistent {
        aggregate_id,
        reason: format!("sequence {value} out of range"),
    })
}

/// Projection store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgProjectionStore {
    pool: PgPool,
}

impl PgProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectionStore for PgProjectionStore {
    async fn balance(&self, aggregate_id: Uuid) -> Result<Option<BalanceRow>, ProjectionError> {
        let row: Option<(String, i64, String, i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT asset_code, balance, status, last_applied_sequence, updated_at
            FROM account_balances
            WHERE account_id = $1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(asset_code, balance, status, last_applied, updated_at)| {
            Ok(BalanceRow {
                aggregate_id,
                asset_code: parse_asset(aggregate_id, asset_code)?,
                balance,
                status: parse_status(aggregate_id, &status)?,
                last_applied_sequence: to_u64(aggregate_id, last_applied)?,
                updated_at,
            })
        })
        .transpose()
    }

    async fn transactions(
        &self,
        aggregate_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionRow>, ProjectionError> {
        let rows: Vec<(i64, String, i64, String, Option<Uuid>, String, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT sequence, kind, amount, asset_code, transfer_id, description, recorded_at
                FROM account_transactions
                WHERE account_id = $1
                ORDER BY sequence DESC
                LIMIT $2 OFFSET $3
                "#,
            )
            .bind(aggregate_id)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(
                |(sequence, kind, amount, asset_code, transfer_id, description, recorded_at)| {
                    let kind = TransactionKind::parse(&kind).ok_or_else(|| {
                        ProjectionError::Inconsistent {
                            aggregate_id,
                            reason: format!("unknown transaction kind {kind:?}"),
                        }
                    })?;
                    Ok(TransactionRow {
                        aggregate_id,
                        sequence: to_u64(aggregate_id, sequence)?,
                        kind,
                        amount,
                        asset_code: parse_asset(aggregate_id, asset_code)?,
                        transfer_id,
                        description,
                        recorded_at,
                    })
                },
            )
            .collect()
    }

    async fn commit(
        &self,
        expected_sequence: u64,
        row: BalanceRow,
        transaction: Option<TransactionRow>,
    ) -> Result<(), ProjectionError> {
        let aggregate_id = row.aggregate_id;
        let mut tx = self.pool.begin().await?;

        let rows_affected = if expected_sequence == 0 {
            sqlx::query(
                r#"
                INSERT INTO account_balances (
                    account_id, asset_code, balance, status, last_applied_sequence, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (account_id) DO NOTHING
                "#,
            )
            .bind(aggregate_id)
            .bind(row.asset_code.as_str())
            .bind(row.balance)
            .bind(row.status.as_str())
            .bind(to_i64(aggregate_id, row.last_applied_sequence)?)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE account_balances
                SET
                    balance = $2,
                    status = $3,
                    last_applied_sequence = $4,
                    updated_at = $5
                WHERE account_id = $1 AND last_applied_sequence = $6
                "#,
            )
            .bind(aggregate_id)
            .bind(row.balance)
            .bind(row.status.as_str())
            .bind(to_i64(aggregate_id, row.last_applied_sequence)?)
            .bind(row.updated_at)
            .bind(to_i64(aggregate_id, expected_sequence)?)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if rows_affected == 0 {
            tx.rollback().await?;
            let actual = self
                .balance(aggregate_id)
                .await?
                .map(|r| r.last_applied_sequence)
                .unwrap_or(0);
            return Err(ProjectionError::StaleWrite {
                aggregate_id,
                expected: expected_sequence,
                actual,
            });
        }

        if let Some(t) = transaction {
            sqlx::query(
                r#"
                INSERT INTO account_transactions (
                    account_id, sequence, kind, amount, asset_code,
                    transfer_id, description, recorded_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (account_id, sequence) DO NOTHING
                "#,
            )
            .bind(t.aggregate_id)
            .bind(to_i64(aggregate_id, t.sequence)?)
            .bind(t.kind.as_str())
            .bind(t.amount)
            .bind(t.asset_code.as_str())
            .bind(t.transfer_id)
            .bind(&t.description)
            .bind(t.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
