//! Command definitions
//!
//! Commands represent intentions to change the system state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Account, AccountStatus, Aggregate, Transfer, TransferStatus};
use crate::domain::{AssetCode, DomainError, Money};

// =========================================================================
// Account commands
// =========================================================================

/// Command to open a new account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAccountCommand {
    pub account_id: Uuid,
    pub asset_code: AssetCode,
    pub owner_id: Option<Uuid>,
}

impl OpenAccountCommand {
    pub fn new(account_id: Uuid, asset_code: AssetCode) -> Self {
        Self {
            account_id,
            asset_code,
            owner_id: None,
        }
    }

    pub fn with_owner(mut self, owner_id: Uuid) -> Self {
        self.owner_id = Some(owner_id);
        self
    }
}

/// Credit or debit of an account, in minor units.
///
/// When `asset_code` is absent the account's own asset is assumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementCommand {
    pub account_id: Uuid,
    pub amount: i64,
    pub asset_code: Option<AssetCode>,
    /// Transfer this leg belongs to
    pub transfer_id: Option<Uuid>,
    pub description: Option<String>,
}

impl MovementCommand {
    pub fn new(account_id: Uuid, amount: i64) -> Self {
        Self {
            account_id,
            amount,
            asset_code: None,
            transfer_id: None,
            description: None,
        }
    }

    /// Movement of an exact `Money` value
    pub fn of(account_id: Uuid, money: &Money) -> Self {
        Self::new(account_id, money.amount()).with_asset(money.asset_code().clone())
    }

    pub fn with_asset(mut self, asset_code: AssetCode) -> Self {
        self.asset_code = Some(asset_code);
        self
    }

    pub fn with_transfer(mut self, transfer_id: Uuid) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Resolve the amount against the account's asset
    pub(crate) fn money_for(&self, account: &Account) -> Result<Money, DomainError> {
        let asset_code = self
            .asset_code
            .clone()
            .unwrap_or_else(|| account.asset_code().clone());
        Ok(Money::new(self.amount, asset_code)?)
    }
}

pub type DepositCommand = MovementCommand;
pub type WithdrawCommand = MovementCommand;

/// Command to transfer money between two accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCommand {
    /// Defaults to the caller's idempotency key, else a fresh id
    pub transfer_id: Option<Uuid>,
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: i64,
    pub asset_code: Option<AssetCode>,
    pub description: Option<String>,
}

impl TransferCommand {
    pub fn new(from_account_id: Uuid, to_account_id: Uuid, amount: i64) -> Self {
        Self {
            transfer_id: None,
            from_account_id,
            to_account_id,
            amount,
            asset_code: None,
            description: None,
        }
    }

    pub fn with_id(mut self, transfer_id: Uuid) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    pub fn with_asset(mut self, asset_code: AssetCode) -> Self {
        self.asset_code = Some(asset_code);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// =========================================================================
// Results
// =========================================================================

/// Result of an account command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub account_id: Uuid,
    pub version: u64,
    pub events_appended: usize,
    /// The idempotency key was already recorded; nothing was appended
    pub already_applied: bool,
    pub balance: i64,
    pub asset_code: AssetCode,
    pub status: AccountStatus,
}

impl CommandOutcome {
    pub(crate) fn applied(account: &Account, events_appended: usize) -> Self {
        Self {
            account_id: account.id(),
            version: account.version(),
            events_appended,
            already_applied: false,
            balance: account.balance().amount(),
            asset_code: account.asset_code().clone(),
            status: account.status(),
        }
    }

    pub(crate) fn replayed(account: &Account) -> Self {
        Self {
            already_applied: true,
            ..Self::applied(account, 0)
        }
    }
}

/// Result of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: Uuid,
    pub workflow_id: Uuid,
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: i64,
    pub asset_code: AssetCode,
    pub status: TransferStatus,
    pub failure_reason: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Transfer> for TransferResult {
    fn from(transfer: &Transfer) -> Self {
        Self {
            transfer_id: transfer.id(),
            workflow_id: transfer.workflow_id(),
            from_account_id: transfer.from_account_id(),
            to_account_id: transfer.to_account_id(),
            amount: transfer.amount().amount(),
            asset_code: transfer.amount().asset_code().clone(),
            status: transfer.status(),
            failure_reason: transfer.failure_reason().map(str::to_string),
            initiated_at: transfer.initiated_at(),
            finished_at: transfer.finished_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OperationContext;

    fn usd() -> AssetCode {
        AssetCode::new("USD").unwrap()
    }

    #[test]
    fn test_movement_defaults_to_account_asset() {
        let (account, _) = Account::open(Uuid::new_v4(), usd(), None, &OperationContext::now());

        let money = MovementCommand::new(account.id(), 250)
            .money_for(&account)
            .unwrap();
        assert_eq!(money.amount(), 250);
        assert_eq!(money.asset_code(), &usd());
    }

    #[test]
    fn test_negative_movement_rejected() {
        let (account, _) = Account::open(Uuid::new_v4(), usd(), None, &OperationContext::now());

        let err = MovementCommand::new(account.id(), -5)
            .money_for(&account)
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_amount");
    }

    #[test]
    fn test_transfer_command_builder() {
        let id = Uuid::new_v4();
        let cmd = TransferCommand::new(Uuid::new_v4(), Uuid::new_v4(), 100)
            .with_id(id)
            .with_description("rent");

        assert_eq!(cmd.transfer_id, Some(id));
        assert_eq!(cmd.description.as_deref(), Some("rent"));
        assert!(cmd.asset_code.is_none());
    }
}
