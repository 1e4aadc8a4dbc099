//! Projection module
//!
//! Updates read-model tables (projections) from events.
//! Projections are optimized for queries and derived from events; they can
//! always be rebuilt by replaying the log.

mod postgres;
mod projector;
mod store;

use uuid::Uuid;

pub use postgres::PgProjectionStore;
pub use projector::{ApplyOutcome, BalanceProjector, ProjectorRunner};
pub use store::{
    BalanceRow, InMemoryProjectionStore, ProjectionStore, TransactionKind, TransactionRow,
};

use crate::event_store::EventLogError;

/// Projection errors
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Event arrived ahead of the projection; catch up from the log
    #[error("Sequence gap for {aggregate_id}: expected {expected}, got {found}")]
    SequenceGap {
        aggregate_id: Uuid,
        expected: u64,
        found: u64,
    },

    /// Another writer advanced the row first
    #[error("Stale projection write for {aggregate_id}: expected sequence {expected}, found {actual}")]
    StaleWrite {
        aggregate_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Projection of {aggregate_id} is inconsistent: {reason}")]
    Inconsistent { aggregate_id: Uuid, reason: String },

    #[error("Event decode error: {0}")]
    Decode(#[from] crate::domain::EventDecodeError),

    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
