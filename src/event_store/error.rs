//! Event Log Errors
//!
//! Error types for event log operations.

use uuid::Uuid;

use super::hash::ChainError;

/// Errors that can occur in the event log
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// Optimistic concurrency conflict
    #[error("Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// Idempotency key already recorded for this aggregate
    #[error("Operation {idempotency_key} already recorded at sequence {sequence}")]
    DuplicateOperation {
        idempotency_key: Uuid,
        sequence: u64,
    },

    #[error("Append requires at least one event")]
    EmptyAppend,

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend temporarily unreachable
    #[error("Event log unavailable: {0}")]
    Unavailable(String),

    /// Stored data failed an integrity check
    #[error("Corrupted event stream: {0}")]
    Corrupted(String),
}

impl EventLogError {
    /// Check if this error is a concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventLogError::ConcurrencyConflict { .. })
    }

    /// Infrastructure failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EventLogError::Database(_) | EventLogError::Unavailable(_)
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.is_concurrency_conflict() || self.is_transient()
    }
}

impl From<ChainError> for EventLogError {
    fn from(err: ChainError) -> Self {
        EventLogError::Corrupted(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let conflict = EventLogError::ConcurrencyConflict {
            aggregate_id: Uuid::nil(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_concurrency_conflict());
        assert!(conflict.is_retryable());
        assert!(!conflict.is_transient());

        assert!(EventLogError::Unavailable("down".into()).is_transient());
        assert!(!EventLogError::EmptyAppend.is_retryable());
        assert!(!EventLogError::Corrupted("x".into()).is_retryable());
    }
}
