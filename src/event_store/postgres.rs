//! PostgreSQL event log
//!
//! Streams live in the `events` table. Unique constraints on
//! `(aggregate_id, sequence)` and `(aggregate_id, idempotency_key)` back the
//! in-transaction checks against racing writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{EventBus, EventHash, EventLog, EventLogError, NewEvent, RecordedEvent};

const UNIQUE_VIOLATION: &str = "23505";

type EventRow = (
    Uuid,
    i64,
    String,
    Vec<u8>,
    Vec<u8>,
    Option<Uuid>,
    DateTime<Utc>,
);

fn to_sequence(value: i64) -> Result<u64, EventLogError> {
    u64::try_from(value)
        .map_err(|_| EventLogError::Corrupted(format!("negative sequence {value}")))
}

fn to_db_sequence(value: u64) -> Result<i64, EventLogError> {
    i64::try_from(value)
        .map_err(|_| EventLogError::Corrupted(format!("sequence {value} out of range")))
}

fn row_to_event(row: EventRow) -> Result<RecordedEvent, EventLogError> {
    let (aggregate_id, sequence, event_type, payload, hash, idempotency_key, recorded_at) = row;
    let hash = EventHash::from_bytes(&hash).ok_or_else(|| {
        EventLogError::Corrupted(format!(
            "hash of {aggregate_id}/{sequence} has {} bytes",
            hash.len()
        ))
    })?;

    Ok(RecordedEvent {
        aggregate_id,
        sequence: to_sequence(sequence)?,
        event_type,
        payload,
        hash,
        idempotency_key,
        recorded_at,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

/// Event log backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgEventLog {
    pool: PgPool,
    bus: EventBus,
}

impl PgEventLog {
    /// Create a new event log with a database pool
    pub fn new(pool: PgPool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Single attempt, inside one transaction
    async fn try_append(
        &self,
        aggregate_id: Uuid,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        let mut tx = self.pool.begin().await?;

        let keys: Vec<Uuid> = events.iter().filter_map(|e| e.idempotency_key).collect();
        if !keys.is_empty() {
            let existing: Option<(Uuid, i64)> = sqlx::query_as(
                r#"
                SELECT idempotency_key, sequence
                FROM events
                WHERE aggregate_id = $1 AND idempotency_key = ANY($2)
                ORDER BY sequence ASC
                LIMIT 1
                "#,
            )
            .bind(aggregate_id)
            .bind(&keys)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((key, sequence)) = existing {
                return Err(EventLogError::DuplicateOperation {
                    idempotency_key: key,
                    sequence: to_sequence(sequence)?,
                });
            }
        }

        let (actual, mut previous) = self.head(&mut tx, aggregate_id).await?;
        if actual != expected_version {
            return Err(EventLogError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let mut recorded = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let sequence = expected_version + offset as u64 + 1;
            let hash = EventHash::compute(&previous, &event.payload);
            previous = hash;

            let recorded_at: DateTime<Utc> = sqlx::query_scalar(
                r#"
                INSERT INTO events (
                    aggregate_id, sequence, event_type, payload, hash, idempotency_key
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING recorded_at
                "#,
            )
            .bind(aggregate_id)
            .bind(to_db_sequence(sequence)?)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(hash.as_bytes().as_slice())
            .bind(event.idempotency_key)
            .fetch_one(&mut *tx)
            .await?;

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

        tx.commit().await?;
        Ok(recorded)
    }

    /// Current version and last hash of a stream
    async fn head(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: Uuid,
    ) -> Result<(u64, EventHash), EventLogError> {
        let head: Option<(i64, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT sequence, hash FROM events
            WHERE aggregate_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&mut **tx)
        .await?;

        match head {
            Some((sequence, hash)) => {
                let hash = EventHash::from_bytes(&hash).ok_or_else(|| {
                    EventLogError::Corrupted(format!("bad hash at {aggregate_id}/{sequence}"))
                })?;
                Ok((to_sequence(sequence)?, hash))
            }
            None => Ok((0, EventHash::GENESIS)),
        }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(
        &self,
        aggregate_id: Uuid,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError> {
        if events.is_empty() {
            return Err(EventLogError::EmptyAppend);
        }

        let recorded = match self.try_append(aggregate_id, expected_version, events).await {
            Ok(recorded) => recorded,
            Err(EventLogError::Database(err)) if is_unique_violation(&err) => {
                // Lost the race to another writer between the check and the insert
                let actual = self.current_version(aggregate_id).await?;
                return Err(EventLogError::ConcurrencyConflict {
                    aggregate_id,
                    expected: expected_version,
                    actual,
                });
            }
            Err(err) => return Err(err),
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
        let pool = self.pool.clone();

        async move {
            let rows: Result<Vec<EventRow>, EventLogError> = async {
                Ok(sqlx::query_as::<_, EventRow>(
                    r#"
                    SELECT aggregate_id, sequence, event_type, payload, hash, idempotency_key, recorded_at
                    FROM events
                    WHERE aggregate_id = $1 AND sequence >= $2
                    ORDER BY sequence ASC
                    "#,
                )
                .bind(aggregate_id)
                .bind(to_db_sequence(from_sequence)?)
                .fetch_all(&pool)
                .await?)
            }
            .await;

            let items: Vec<Result<RecordedEvent, EventLogError>> = match rows {
                Ok(rows) => rows.into_iter().map(row_to_event).collect(),
                Err(err) => vec![Err(err)],
            };
            stream::iter(items)
        }
        .flatten_stream()
        .boxed()
    }

    async fn current_version(&self, aggregate_id: Uuid) -> Result<u64, EventLogError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id)
                .fetch_one(&self.pool)
                .await?;

        version.map(to_sequence).transpose().map(|v| v.unwrap_or(0))
    }

    async fn find_by_idempotency_key(
        &self,
        aggregate_id: Uuid,
        key: Uuid,
    ) -> Result<Option<RecordedEvent>, EventLogError> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT aggregate_id, sequence, event_type, payload, hash, idempotency_key, recorded_at
            FROM events
            WHERE aggregate_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(aggregate_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_event).transpose()
    }

    async fn aggregate_ids(&self) -> Result<Vec<Uuid>, EventLogError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT DISTINCT aggregate_id FROM events ORDER BY aggregate_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordedEvent> {
        self.bus.subscribe()
    }
}
