//! Account Aggregate
//!
//! Account is the core aggregate for managing balances of one asset.
//! It applies events to maintain current state and generates events for
//! commands. Nothing here touches I/O or the clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AccountEvent, AssetCode, DomainError, Money, OperationContext};

use super::{Aggregate, AggregateError};

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Closed => "closed",
        }
    }
}

/// Outcome of a command: the state after the new events, and the events
/// to append. An empty event list means the command was a no-op.
pub type Decision = (Account, Vec<AccountEvent>);

/// Account Aggregate
///
/// State is derived from events, never directly mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    id: Uuid,
    owner_id: Option<Uuid>,
    asset_code: AssetCode,
    /// Current balance (derived from events)
    balance: Money,
    status: AccountStatus,
    /// Current version (number of events applied)
    version: u64,
    created_at: DateTime<Utc>,
    frozen_reason: Option<String>,
}

impl Account {
    // =========================================================================
    // Commands
    // =========================================================================

    /// Open a new account and generate the creation event
    pub fn open(
        account_id: Uuid,
        asset_code: AssetCode,
        owner_id: Option<Uuid>,
        ctx: &OperationContext,
    ) -> (Self, AccountEvent) {
        let event = AccountEvent::AccountCreated {
            account_id,
            owner_id,
            asset_code: asset_code.clone(),
            created_at: ctx.occurred_at,
        };

        let account = Self {
            id: account_id,
            owner_id,
            balance: Money::zero(asset_code.clone()),
            asset_code,
            status: AccountStatus::Active,
            version: 1,
            created_at: ctx.occurred_at,
            frozen_reason: None,
        };

        (account, event)
    }

    /// Credit money to the account
    pub fn deposit(
        &self,
        amount: &Money,
        transfer_id: Option<Uuid>,
        description: impl Into<String>,
        ctx: &OperationContext,
    ) -> Result<Decision, DomainError> {
        self.ensure_valid_amount(amount)?;
        self.ensure_open()?;

        // Reject before the event exists rather than during replay
        self.balance.checked_add(amount)?;

        let event = AccountEvent::MoneyAdded {
            account_id: self.id,
            amount: amount.clone(),
            transfer_id,
            description: description.into(),
            actor_id: ctx.actor_id,
            added_at: ctx.occurred_at,
        };
        self.decide(vec![event])
    }

    /// Debit money from the account
    pub fn withdraw(
        &self,
        amount: &Money,
        transfer_id: Option<Uuid>,
        description: impl Into<String>,
        ctx: &OperationContext,
    ) -> Result<Decision, DomainError> {
        self.ensure_valid_amount(amount)?;
        self.ensure_open()?;

        if !self.balance.is_sufficient_for(amount) {
            return Err(DomainError::insufficient_funds(
                amount.amount(),
                self.balance.amount(),
            ));
        }

        let event = AccountEvent::MoneySubtracted {
            account_id: self.id,
            amount: amount.clone(),
            transfer_id,
            description: description.into(),
            actor_id: ctx.actor_id,
            subtracted_at: ctx.occurred_at,
        };
        self.decide(vec![event])
    }

    /// Freeze the account. Freezing a frozen account changes nothing.
    pub fn freeze(
        &self,
        reason: impl Into<String>,
        ctx: &OperationContext,
    ) -> Result<Decision, DomainError> {
        match self.status {
            AccountStatus::Closed => Err(DomainError::AccountClosed { account_id: self.id }),
            AccountStatus::Frozen => Ok((self.clone(), Vec::new())),
            AccountStatus::Active => self.decide(vec![AccountEvent::AccountFrozen {
                account_id: self.id,
                reason: reason.into(),
                actor_id: ctx.actor_id,
                frozen_at: ctx.occurred_at,
            }]),
        }
    }

    /// Unfreeze the account. No-op when already active.
    pub fn unfreeze(&self, ctx: &OperationContext) -> Result<Decision, DomainError> {
        match self.status {
            AccountStatus::Closed => Err(DomainError::AccountClosed { account_id: self.id }),
            AccountStatus::Active => Ok((self.clone(), Vec::new())),
            AccountStatus::Frozen => self.decide(vec![AccountEvent::AccountUnfrozen {
                account_id: self.id,
                actor_id: ctx.actor_id,
                unfrozen_at: ctx.occurred_at,
            }]),
        }
    }

    /// Close the account. Requires a zero balance.
    pub fn close(
        &self,
        reason: impl Into<String>,
        ctx: &OperationContext,
    ) -> Result<Decision, DomainError> {
        if self.status == AccountStatus::Closed {
            return Ok((self.clone(), Vec::new()));
        }
        if !self.balance.is_zero() {
            return Err(DomainError::NonZeroBalance {
                balance: self.balance.amount(),
            });
        }

        self.decide(vec![AccountEvent::AccountClosed {
            account_id: self.id,
            reason: reason.into(),
            actor_id: ctx.actor_id,
            closed_at: ctx.occurred_at,
        }])
    }

    fn ensure_valid_amount(&self, amount: &Money) -> Result<(), DomainError> {
        if !amount.is_positive() {
            return Err(DomainError::InvalidAmount(
                "amount must be greater than zero".to_string(),
            ));
        }
        if amount.asset_code() != &self.asset_code {
            return Err(DomainError::AssetMismatch {
                expected: self.asset_code.clone(),
                found: amount.asset_code().clone(),
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DomainError> {
        match self.status {
            AccountStatus::Active => Ok(()),
            AccountStatus::Frozen => Err(DomainError::AccountFrozen { account_id: self.id }),
            AccountStatus::Closed => Err(DomainError::AccountClosed { account_id: self.id }),
        }
    }

    fn decide(&self, events: Vec<AccountEvent>) -> Result<Decision, DomainError> {
        let mut next = self.clone();
        for event in &events {
            next = next
                .apply(event.clone())
                .map_err(|e| DomainError::InvalidTransition(e.to_string()))?;
        }
        Ok((next, events))
    }

    // =========================================================================
    // Getters
    // =========================================================================

    pub fn owner_id(&self) -> Option<Uuid> {
        self.owner_id
    }

    pub fn asset_code(&self) -> &AssetCode {
        &self.asset_code
    }

    pub fn balance(&self) -> &Money {
        &self.balance
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn is_frozen(&self) -> bool {
        self.status == AccountStatus::Frozen
    }

    pub fn is_closed(&self) -> bool {
        self.status == AccountStatus::Closed
    }

    pub fn frozen_reason(&self) -> Option<&str> {
        self.frozen_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// =========================================================================
// Replay
// =========================================================================

impl Aggregate for Account {
    type Event = AccountEvent;

    fn aggregate_type() -> &'static str {
        "Account"
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn genesis(aggregate_id: Uuid, event: AccountEvent) -> Result<Self, AggregateError> {
        match event {
            AccountEvent::AccountCreated {
                account_id,
                owner_id,
                asset_code,
                created_at,
            } => {
                if account_id != aggregate_id {
                    return Err(AggregateError::invariant(
                        aggregate_id,
                        format!("creation event names account {account_id}"),
                    ));
                }
                Ok(Self {
                    id: account_id,
                    owner_id,
                    balance: Money::zero(asset_code.clone()),
                    asset_code,
                    status: AccountStatus::Active,
                    version: 1,
                    created_at,
                    frozen_reason: None,
                })
            }
            other => Err(AggregateError::MissingGenesis {
                aggregate_id,
                found: crate::domain::DomainEvent::event_type(&other).to_string(),
            }),
        }
    }

    fn apply(mut self, event: AccountEvent) -> Result<Self, AggregateError> {
        if self.status == AccountStatus::Closed {
            return Err(AggregateError::invariant(self.id, "event after AccountClosed"));
        }

        match event {
            AccountEvent::AccountCreated { .. } => {
                return Err(AggregateError::invariant(self.id, "duplicate AccountCreated"));
            }

            AccountEvent::MoneyAdded { amount, .. } => {
                self.balance = self.balance.checked_add(&amount).map_err(|e| {
                    tracing::error!(account_id = %self.id, error = %e, "Credit replay failed");
                    AggregateError::invariant(self.id, e.to_string())
                })?;
            }

            AccountEvent::MoneySubtracted { amount, .. } => {
                self.balance = self.balance.checked_sub(&amount).map_err(|e| {
                    tracing::error!(account_id = %self.id, error = %e, "Debit replay failed");
                    AggregateError::invariant(self.id, e.to_string())
                })?;
            }

            AccountEvent::AccountFrozen { reason, .. } => {
                self.status = AccountStatus::Frozen;
                self.frozen_reason = Some(reason);
            }

            AccountEvent::AccountUnfrozen { .. } => {
                self.status = AccountStatus::Active;
                self.frozen_reason = None;
            }

            AccountEvent::AccountClosed { .. } => {
                self.status = AccountStatus::Closed;
            }
        }

        self.version += 1;
        Ok(self)
    }
}
