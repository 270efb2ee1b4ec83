//! Repository for the consumer-side `consumer_events` table.
//!
//! Differs from the outbox in two ways: receipt is an idempotent upsert so
//! broker redelivery is absorbed on `id`, and there is no per-event
//! re-enqueue since a handler failure is terminal; redelivery is the
//! broker's responsibility.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{Event, EventId},
    time::Clock,
};

const COLUMNS: &str = "id, worker, status, subject, event_type, source, dataschema, data, \
                       dispatched_at, scheduled_at, finished_at, error";

/// Repository for consumer-side event operations.
pub struct Repository {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Persists an inbound event, treating a duplicate `id` as success.
    ///
    /// Invoked by the receiver before the broker message is acknowledged.
    /// Keeps the `dispatched_at` carried on the wire so claim order follows
    /// producer time. Returns whether a row was actually inserted.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails for any reason other than a
    /// duplicate key.
    pub async fn upsert_on_receive(&self, event: &Event) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumer_events
                (id, worker, status, subject, event_type, source, dataschema, data, dispatched_at)
            VALUES ($1, NULL, 'queued', $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.subject)
        .bind(&event.event_type)
        .bind(&event.source)
        .bind(&event.dataschema)
        .bind(&event.data)
        .bind(event.dispatched_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Atomically claims up to `batch_size` queued events for a worker.
    ///
    /// Same contract as the outbox claim: `(dispatched_at, id)` order,
    /// `FOR UPDATE SKIP LOCKED`, `CoreError::NoEventsToSchedule` when the
    /// queue is empty.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NoEventsToSchedule` when no queued rows match.
    pub async fn claim_batch(&self, worker_id: &str, batch_size: usize) -> Result<Vec<Event>> {
        let now = self.clock.now_utc();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM consumer_events
            WHERE status = 'queued'
            ORDER BY dispatched_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Err(CoreError::NoEventsToSchedule);
        }

        let mut events = sqlx::query_as::<_, Event>(&format!(
            r#"
            UPDATE consumer_events
            SET status = 'scheduled', worker = $1, scheduled_at = $2
            WHERE id = ANY($3)
            RETURNING {COLUMNS}
            "#,
        ))
        .bind(worker_id)
        .bind(now)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        events.sort_by(|a, b| (a.dispatched_at, a.id).cmp(&(b.dispatched_at, b.id)));

        Ok(events)
    }

    /// Marks a claimed event as processed after its handler returned
    /// successfully. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_processed(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE consumer_events
            SET status = 'processed', finished_at = $1
            WHERE id = $2 AND status = 'scheduled'
            "#,
        )
        .bind(self.clock.now_utc())
        .bind(event_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a claimed event as failed. Terminal; there is no local retry.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(&self, event_id: EventId, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE consumer_events
            SET status = 'failed', finished_at = $1, error = $2
            WHERE id = $3 AND status = 'scheduled'
            "#,
        )
        .bind(self.clock.now_utc())
        .bind(reason)
        .bind(event_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Crash-recovery sweep: re-enqueues every row still scheduled under
    /// `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reenqueue_worker(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE consumer_events
            SET status = 'queued', worker = NULL, scheduled_at = NULL, error = NULL
            WHERE status = 'scheduled' AND worker = $1
            "#,
        )
        .bind(worker_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds an event by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "SELECT {COLUMNS} FROM consumer_events WHERE id = $1",
        ))
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }
}
