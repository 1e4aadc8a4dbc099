//! In-memory event log

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{EventBus, EventHash, EventLog, EventLogError, NewEvent, RecordedEvent};

#[derive(Debug, Default)]
struct Stream {
    events: Vec<RecordedEvent>,
    /// idempotency key -> sequence
    keys: HashMap<Uuid, u64>,
}

impl Stream {
    fn version(&self) -> u64 {
        self.events.len() as u64
    }

    fn last_hash(&self) -> EventHash {
        self.events
            .last()
            .map(|e| e.hash)
            .unwrap_or(EventHash::GENESIS)
    }
}

/// Event log held in process memory.
///
/// A single write lock makes each append atomic; readers see either all or
/// none of a batch.
#[derive(Debug, Clone)]
pub struct InMemoryEventLog {
    streams: Arc<RwLock<HashMap<Uuid, Stream>>>,
    bus: EventBus,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_bus(EventBus::default())
    }

    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        aggregate_id: Uuid,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError> {
        if events.is_empty() {
            return Err(EventLogError::EmptyAppend);
        }

        let recorded = {
            let mut streams = self.streams.write().await;
            let stream = streams.entry(aggregate_id).or_default();

            for event in &events {
                if let Some(key) = event.idempotency_key {
                    if let Some(&sequence) = stream.keys.get(&key) {
                        return Err(EventLogError::DuplicateOperation {
                            idempotency_key: key,
                            sequence,
                        });
                    }
                }
            }

            let actual = stream.version();
            if actual != expected_version {
                return Err(EventLogError::ConcurrencyConflict {
                    aggregate_id,
                    expected: expected_version,
                    actual,
                });
            }

            let recorded_at = Utc::now();
            let mut previous = stream.last_hash();
            let mut recorded = Vec::with_capacity(events.len());

            for (offset, event) in events.into_iter().enumerate() {
                let sequence = expected_version + offset as u64 + 1;
                let hash = EventHash::compute(&previous, &event.payload);
                previous = hash;

                recorded.push(RecordedEvent {
                    aggregate_id,
                    sequence,
                    event_type: event.event_type,
                    payload: event.payload,
                    hash,
                    idempotency_key: event.idempotency_key,
                    recorded_at,
                });
            }

            for event in &recorded {
                if let Some(key) = event.idempotency_key {
                    stream.keys.insert(key, event.sequence);
                }
            }
            stream.events.extend(recorded.iter().cloned());
            recorded
        };

        let new_version = expected_version + recorded.len() as u64;
        tracing::debug!(
            aggregate_id = %aggregate_id,
            version = new_version,
            count = recorded.len(),
            "Events appended"
        );

        for event in recorded {
            self.bus.publish(event);
        }

        Ok(new_version)
    }

    fn read(
        &self,
        aggregate_id: Uuid,
        from_sequence: u64,
    ) -> BoxStream<'static, Result<RecordedEvent, EventLogError>> {
        let streams = Arc::clone(&self.streams);

        async move {
            let streams = streams.read().await;
            let events: Vec<Result<RecordedEvent, EventLogError>> = streams
                .get(&aggregate_id)
                .map(|s| {
                    s.events
                        .iter()
                        .filter(|e| e.sequence >= from_sequence)
                        .cloned()
                        .map(Ok)
                        .collect()
                })
                .unwrap_or_default();
            stream::iter(events)
        }
        .flatten_stream()
        .boxed()
    }

    async fn current_version(&self, aggregate_id: Uuid) -> Result<u64, EventLogError> {
        let streams = self.streams.read().await;
        Ok(streams.get(&aggregate_id).map(Stream::version).unwrap_or(0))
    }

    async fn find_by_idempotency_key(
        &self,
        aggregate_id: Uuid,
        key: Uuid,
    ) -> Result<Option<RecordedEvent>, EventLogError> {
        let streams = self.streams.read().await;
        let found = streams.get(&aggregate_id).and_then(|stream| {
            let sequence = *stream.keys.get(&key)?;
            stream.events.get((sequence - 1) as usize).cloned()
        });
        Ok(found)
    }

    async fn aggregate_ids(&self) -> Result<Vec<Uuid>, EventLogError> {
        let streams = self.streams.read().await;
        let mut ids: Vec<Uuid> = streams
            .iter()
            .filter(|(_, s)| !s.events.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordedEvent> {
        self.bus.subscribe()
    }
}
