//! Domain Events
//!
//! Event definitions for Event Sourcing.
//! Events are immutable facts that have happened in the system. They are
//! stored as JSON payloads tagged with their `type`.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::money::{AssetCode, Money};

/// Errors raised while turning a stored payload back into a domain event
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Event type {declared} does not match payload type {found}")]
    TypeMismatch { declared: String, found: String },

    #[error("Malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Shared behaviour of the event enums stored in the log
pub trait DomainEvent: Serialize + DeserializeOwned + Sized {
    /// Every event type this enum can decode
    const EVENT_TYPES: &'static [&'static str];

    /// Get the event type as a string
    fn event_type(&self) -> &'static str;

    /// Serialize to the stored payload
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a stored payload, rejecting event types this enum doesn't know
    fn decode(event_type: &str, payload: &[u8]) -> Result<Self, EventDecodeError> {
        if !Self::handles(event_type) {
            return Err(EventDecodeError::UnknownEventType(event_type.to_string()));
        }

        let event: Self = serde_json::from_slice(payload)?;
        if event.event_type() != event_type {
            return Err(EventDecodeError::TypeMismatch {
                declared: event_type.to_string(),
                found: event.event_type().to_string(),
            });
        }

        Ok(event)
    }

    fn handles(event_type: &str) -> bool {
        Self::EVENT_TYPES.contains(&event_type)
    }
}

/// Account-related events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccountEvent {
    /// Account was opened
    AccountCreated {
        account_id: Uuid,
        owner_id: Option<Uuid>,
        asset_code: AssetCode,
        created_at: DateTime<Utc>,
    },

    /// Money was added to the account (balance increased)
    MoneyAdded {
        account_id: Uuid,
        amount: Money,
        transfer_id: Option<Uuid>,
        description: String,
        actor_id: Option<Uuid>,
        added_at: DateTime<Utc>,
    },

    /// Money was subtracted from the account (balance decreased)
    MoneySubtracted {
        account_id: Uuid,
        amount: Money,
        transfer_id: Option<Uuid>,
        description: String,
        actor_id: Option<Uuid>,
        subtracted_at: DateTime<Utc>,
    },

    AccountFrozen {
        account_id: Uuid,
        reason: String,
        actor_id: Option<Uuid>,
        frozen_at: DateTime<Utc>,
    },

    AccountUnfrozen {
        account_id: Uuid,
        actor_id: Option<Uuid>,
        unfrozen_at: DateTime<Utc>,
    },

    /// Terminal event; no command is accepted afterwards
    AccountClosed {
        account_id: Uuid,
        reason: String,
        actor_id: Option<Uuid>,
        closed_at: DateTime<Utc>,
    },
}

impl AccountEvent {
    /// Get the account ID this event relates to
    pub fn account_id(&self) -> Uuid {
        match self {
            AccountEvent::AccountCreated { account_id, .. }
            | AccountEvent::MoneyAdded { account_id, .. }
            | AccountEvent::MoneySubtracted { account_id, .. }
            | AccountEvent::AccountFrozen { account_id, .. }
            | AccountEvent::AccountUnfrozen { account_id, .. }
            | AccountEvent::AccountClosed { account_id, .. } => *account_id,
        }
    }

    /// When the event happened (business time)
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::AccountCreated { created_at, .. } => *created_at,
            AccountEvent::MoneyAdded { added_at, .. } => *added_at,
            AccountEvent::MoneySubtracted { subtracted_at, .. } => *subtracted_at,
            AccountEvent::AccountFrozen { frozen_at, .. } => *frozen_at,
            AccountEvent::AccountUnfrozen { unfrozen_at, .. } => *unfrozen_at,
            AccountEvent::AccountClosed { closed_at, .. } => *closed_at,
        }
    }
}

impl DomainEvent for AccountEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "AccountCreated",
        "MoneyAdded",
        "MoneySubtracted",
        "AccountFrozen",
        "AccountUnfrozen",
        "AccountClosed",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountCreated { .. } => "AccountCreated",
            AccountEvent::MoneyAdded { .. } => "MoneyAdded",
            AccountEvent::MoneySubtracted { .. } => "MoneySubtracted",
            AccountEvent::AccountFrozen { .. } => "AccountFrozen",
            AccountEvent::AccountUnfrozen { .. } => "AccountUnfrozen",
            AccountEvent::AccountClosed { .. } => "AccountClosed",
        }
    }
}

/// Transfer-related events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferEvent {
    /// Transfer was accepted and its workflow scheduled
    TransferInitiated {
        transfer_id: Uuid,
        workflow_id: Uuid,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount: Money,
        description: String,
        initiated_by: Option<Uuid>,
        initiated_at: DateTime<Utc>,
    },

    /// Both legs were durably appended
    TransferCompleted {
        transfer_id: Uuid,
        completed_at: DateTime<Utc>,
    },

    /// The first leg failed, nothing was moved
    TransferFailed {
        transfer_id: Uuid,
        reason: String,
        failed_at: DateTime<Utc>,
    },

    /// A later leg failed and earlier legs were reversed
    TransferCompensated {
        transfer_id: Uuid,
        reason: String,
        compensated_at: DateTime<Utc>,
    },
}

impl TransferEvent {
    /// Get the transfer ID this event relates to
    pub fn transfer_id(&self) -> Uuid {
        match self {
            TransferEvent::TransferInitiated { transfer_id, .. }
            | TransferEvent::TransferCompleted { transfer_id, .. }
            | TransferEvent::TransferFailed { transfer_id, .. }
            | TransferEvent::TransferCompensated { transfer_id, .. } => *transfer_id,
        }
    }
}

impl DomainEvent for TransferEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "TransferInitiated",
        "TransferCompleted",
        "TransferFailed",
        "TransferCompensated",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            TransferEvent::TransferInitiated { .. } => "TransferInitiated",
            TransferEvent::TransferCompleted { .. } => "TransferCompleted",
            TransferEvent::TransferFailed { .. } => "TransferFailed",
            TransferEvent::TransferCompensated { .. } => "TransferCompensated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money_added() -> AccountEvent {
        AccountEvent::MoneyAdded {
            account_id: Uuid::new_v4(),
            amount: Money::new(100, AssetCode::new("USD").unwrap()).unwrap(),
            transfer_id: None,
            description: "Test credit".to_string(),
            actor_id: None,
            added_at: Utc::now(),
        }
    }

    #[test]
    fn test_account_event_encoding() {
        let event = money_added();
        let payload = event.encode().unwrap();
        assert!(String::from_utf8_lossy(&payload).contains(r#""type":"MoneyAdded""#));

        let decoded = AccountEvent::decode("MoneyAdded", &payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_unknown_event_type() {
        let payload = money_added().encode().unwrap();
        let result = AccountEvent::decode("MoneyTeleported", &payload);
        assert!(matches!(result, Err(EventDecodeError::UnknownEventType(t)) if t == "MoneyTeleported"));
    }

    #[test]
    fn test_decode_type_mismatch() {
        let payload = money_added().encode().unwrap();
        let result = AccountEvent::decode("MoneySubtracted", &payload);
        assert!(matches!(result, Err(EventDecodeError::TypeMismatch { .. })));
    }

    #[test]
    fn test_transfer_events_are_not_account_events() {
        assert!(TransferEvent::handles("TransferCompleted"));
        assert!(!AccountEvent::handles("TransferCompleted"));
    }
}
