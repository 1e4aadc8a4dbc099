//! Aggregate rehydration errors

use uuid::Uuid;

use crate::domain::EventDecodeError;

/// Errors raised while replaying a stream.
///
/// Any of these means the stored history cannot be trusted; they are never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Malformed event payload: {0}")]
    Malformed(String),

    #[error("Events out of order for {aggregate_id}: expected sequence {expected}, found {found}")]
    OutOfOrder {
        aggregate_id: Uuid,
        expected: u64,
        found: u64,
    },

    /// Stream does not start with the creation event
    #[error("Stream {aggregate_id} starts with {found} instead of a creation event")]
    MissingGenesis { aggregate_id: Uuid, found: String },

    #[error("Invariant violated replaying {aggregate_id}: {reason}")]
    InvariantViolation { aggregate_id: Uuid, reason: String },
}

impl AggregateError {
    pub fn invariant(aggregate_id: Uuid, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            aggregate_id,
            reason: reason.into(),
        }
    }
}

impl From<EventDecodeError> for AggregateError {
    fn from(err: EventDecodeError) -> Self {
        match err {
            EventDecodeError::UnknownEventType(t) => AggregateError::UnknownEventType(t),
            other => AggregateError::Malformed(other.to_string()),
        }
    }
}
