//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use thiserror::Error;
use uuid::Uuid;

use super::money::{AssetCode, MoneyError};

/// Business rule violations returned by aggregate commands.
///
/// These are never retried automatically; callers handle every variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Balance does not cover the requested debit
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: i64, available: i64 },

    /// Zero, negative or overflowing amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Account is frozen and cannot process transactions
    #[error("Account {account_id} is frozen")]
    AccountFrozen { account_id: Uuid },

    /// Account has been closed
    #[error("Account {account_id} is closed")]
    AccountClosed { account_id: Uuid },

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Account already exists: {0}")]
    AccountAlreadyExists(Uuid),

    /// Amount is denominated in a different asset than the account
    #[error("Asset mismatch: account holds {expected}, got {found}")]
    AssetMismatch { expected: AssetCode, found: AssetCode },

    /// Account still holds funds
    #[error("Account balance must be zero to close (balance {balance})")]
    NonZeroBalance { balance: i64 },

    #[error("Cannot transfer to the same account")]
    SameAccountTransfer,

    #[error("Transfer not found: {0}")]
    TransferNotFound(Uuid),

    /// State transition not allowed from the current state
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl DomainError {
    /// Create an insufficient funds error
    pub fn insufficient_funds(requested: i64, available: i64) -> Self {
        Self::InsufficientFunds {
            requested,
            available,
        }
    }

    /// Stable machine-readable code, exposed to API clients
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::AccountFrozen { .. } => "account_frozen",
            Self::AccountClosed { .. } => "account_closed",
            Self::AccountNotFound(_) => "account_not_found",
            Self::AccountAlreadyExists(_) => "account_already_exists",
            Self::AssetMismatch { .. } => "asset_mismatch",
            Self::NonZeroBalance { .. } => "non_zero_balance",
            Self::SameAccountTransfer => "same_account_transfer",
            Self::TransferNotFound(_) => "transfer_not_found",
            Self::InvalidTransition(_) => "invalid_transition",
        }
    }

    /// The `&'static` form of a code previously produced by `error_code`
    pub fn known_code(code: &str) -> Option<&'static str> {
        [
            "insufficient_funds",
            "invalid_amount",
            "account_frozen",
            "account_closed",
            "account_not_found",
            "account_already_exists",
            "asset_mismatch",
            "non_zero_balance",
            "same_account_transfer",
            "transfer_not_found",
            "invalid_transition",
        ]
        .into_iter()
        .find(|known| *known == code)
    }

    /// Check if this error refers to a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AccountNotFound(_) | Self::TransferNotFound(_))
    }

    /// Check if this error conflicts with existing state
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AccountAlreadyExists(_))
    }
}

impl From<MoneyError> for DomainError {
    fn from(err: MoneyError) -> Self {
        match err {
            MoneyError::AssetMismatch { expected, found } => {
                DomainError::AssetMismatch { expected, found }
            }
            other => DomainError::InvalidAmount(other.to_string()),
        }
    }
}
