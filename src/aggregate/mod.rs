//! Aggregate module
//!
//! Aggregate Root pattern implementation for Event Sourcing.
//! State is a left fold over the stream; commands are pure functions that
//! return the events to append along with the resulting state.

pub mod account;
mod error;
pub mod transfer;

use uuid::Uuid;

use crate::domain::DomainEvent;
use crate::event_store::RecordedEvent;

pub use account::{Account, AccountStatus};
pub use error::AggregateError;
pub use transfer::{Transfer, TransferStatus};

/// Aggregate trait that all aggregates must implement
pub trait Aggregate: Sized {
    /// The type of events this aggregate handles
    type Event: DomainEvent;

    /// Get the aggregate type name (for logs)
    fn aggregate_type() -> &'static str;

    /// Get the aggregate ID
    fn id(&self) -> Uuid;

    /// Get the current version (number of events applied)
    fn version(&self) -> u64;

    /// Build the initial state from the first event of a stream
    fn genesis(aggregate_id: Uuid, event: Self::Event) -> Result<Self, AggregateError>;

    /// Apply an event to update the aggregate state
    fn apply(self, event: Self::Event) -> Result<Self, AggregateError>;
}

/// Replay a full stream. `Ok(None)` means the aggregate doesn't exist.
pub fn rehydrate<A: Aggregate>(events: &[RecordedEvent]) -> Result<Option<A>, AggregateError> {
    let mut state: Option<A> = None;

    for (idx, recorded) in events.iter().enumerate() {
        let expected = idx as u64 + 1;
        if recorded.sequence != expected {
            return Err(AggregateError::OutOfOrder {
                aggregate_id: recorded.aggregate_id,
                expected,
                found: recorded.sequence,
            });
        }

        let event: A::Event = recorded.decode()?;
        state = Some(match state {
            None => A::genesis(recorded.aggregate_id, event)?,
            Some(current) => current.apply(event)?,
        });
    }

    Ok(state)
}
