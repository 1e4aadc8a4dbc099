//! Operation Context
//!
//! Carries who performed an operation and when. Domain code never reads the
//! clock or any ambient identity; both arrive through this context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context for an operation, used for auditing, tracing and idempotency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Actor that issued the command (operator, API client, workflow)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<Uuid>,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Idempotency key attached to the first event a command appends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<Uuid>,

    /// Business time of the operation
    pub occurred_at: DateTime<Utc>,
}

impl OperationContext {
    /// Create a context for an operation happening at `occurred_at`
    pub fn at(occurred_at: DateTime<Utc>) -> Self {
        Self {
            actor_id: None,
            correlation_id: None,
            idempotency_key: None,
            occurred_at,
        }
    }

    /// Create a context stamped with the current time.
    /// Only the outer layers (HTTP, workflow engine) call this.
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    /// Create context with actor
    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Create context with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Create context with idempotency key
    pub fn with_idempotency_key(mut self, key: Uuid) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let actor_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let key = Uuid::new_v4();
        let at = Utc::now();

        let context = OperationContext::at(at)
            .with_actor(actor_id)
            .with_correlation_id(correlation_id)
            .with_idempotency_key(key);

        assert_eq!(context.actor_id, Some(actor_id));
        assert_eq!(context.correlation_id, Some(correlation_id));
        assert_eq!(context.idempotency_key, Some(key));
        assert_eq!(context.occurred_at, at);
    }

    #[test]
    fn test_ensure_correlation_id() {
        let mut context = OperationContext::now();
        assert!(context.correlation_id.is_none());

        let id = context.ensure_correlation_id();
        assert_eq!(context.correlation_id, Some(id));

        // Calling again should return the same ID
        assert_eq!(context.ensure_correlation_id(), id);
    }
}
