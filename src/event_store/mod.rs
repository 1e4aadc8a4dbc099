//! Event Store module
//!
//! Append-only, hash-chained event streams with optimistic concurrency.
//! The in-memory backend serves tests and database-less runs; PostgreSQL
//! is the production backend.

mod bus;
mod error;
pub mod hash;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, TryStreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::DomainEvent;

pub use bus::EventBus;
pub use error::EventLogError;
pub use hash::{ChainError, ChainVerification, EventHash};
pub use memory::InMemoryEventLog;
pub use postgres::PgEventLog;

/// Event as persisted in a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedEvent {
    pub aggregate_id: Uuid,
    /// Position in the stream, starting at 1
    pub sequence: u64,
    pub event_type: String,
    /// JSON-encoded domain event
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub hash: EventHash,
    pub idempotency_key: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Decode the payload as a domain event
    pub fn decode<E: DomainEvent>(&self) -> Result<E, crate::domain::EventDecodeError> {
        E::decode(&self.event_type, &self.payload)
    }
}

/// Event waiting to be appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub idempotency_key: Option<Uuid>,
}

impl NewEvent {
    /// Encode a domain event
    pub fn from_domain<E: DomainEvent>(event: &E) -> Result<Self, EventLogError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            payload: event.encode()?,
            idempotency_key: None,
        })
    }

    pub fn with_idempotency_key(mut self, key: Uuid) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// Encode a batch of domain events, attaching the idempotency key to the
/// first one only.
pub fn encode_events<E: DomainEvent>(
    events: &[E],
    idempotency_key: Option<Uuid>,
) -> Result<Vec<NewEvent>, EventLogError> {
    events
        .iter()
        .enumerate()
        .map(|(idx, event)| {
            let new_event = NewEvent::from_domain(event)?;
            Ok(match idempotency_key {
                Some(key) if idx == 0 => new_event.with_idempotency_key(key),
                _ => new_event,
            })
        })
        .collect()
}

/// Storage backend for event streams
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Atomically append `events` to the stream if it is at
    /// `expected_version`. Returns the new version.
    async fn append(
        &self,
        aggregate_id: Uuid,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError>;

    /// Events with `sequence >= from_sequence`, ascending
    fn read(
        &self,
        aggregate_id: Uuid,
        from_sequence: u64,
    ) -> BoxStream<'static, Result<RecordedEvent, EventLogError>>;

    /// Sequence of the last event, 0 for an empty stream
    async fn current_version(&self, aggregate_id: Uuid) -> Result<u64, EventLogError>;

    async fn find_by_idempotency_key(
        &self,
        aggregate_id: Uuid,
        key: Uuid,
    ) -> Result<Option<RecordedEvent>, EventLogError>;

    /// Every aggregate with at least one event
    async fn aggregate_ids(&self) -> Result<Vec<Uuid>, EventLogError>;

    /// Committed events, published after each successful append
    fn subscribe(&self) -> broadcast::Receiver<RecordedEvent>;
}

/// Read a whole stream into memory
pub async fn load_stream(
    log: &dyn EventLog,
    aggregate_id: Uuid,
) -> Result<Vec<RecordedEvent>, EventLogError> {
    log.read(aggregate_id, 0).try_collect().await
}

/// Recompute the hash chain of a stream
pub async fn verify_stream(
    log: &dyn EventLog,
    aggregate_id: Uuid,
) -> Result<ChainVerification, EventLogError> {
    let events = load_stream(log, aggregate_id).await?;
    Ok(hash::verification_report(aggregate_id, &events))
}
