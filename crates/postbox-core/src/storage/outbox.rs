//! Repository for the publisher-side `publisher_events` table.
//!
//! The insert participates in the caller's transaction so the outbox row
//! commits atomically with the business write. Claims use `FOR UPDATE SKIP
//! LOCKED` so concurrent sender instances make progress without blocking
//! on each other.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{Event, EventId},
    time::Clock,
};

const COLUMNS: &str = "id, worker, status, subject, event_type, source, dataschema, data, \
                       dispatched_at, scheduled_at, finished_at, error";

/// Repository for publisher-side event operations.
pub struct Repository {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Inserts an event within the caller's transaction.
    ///
    /// Forces `status = queued` and stamps `dispatched_at` from the store
    /// clock; the row becomes visible only when the caller commits, so the
    /// business write and the outbox row land atomically.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::EventAlreadyExists` on a duplicate `id`; any
    /// other failure is wrapped as `CoreError::Database`.
    pub async fn insert(&self, tx: &mut Transaction<'_, Postgres>, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publisher_events
                (id, worker, status, subject, event_type, source, dataschema, data, dispatched_at)
            VALUES ($1, NULL, 'queued', $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(&event.subject)
        .bind(&event.event_type)
        .bind(&event.source)
        .bind(&event.dataschema)
        .bind(&event.data)
        .bind(self.clock.now_utc())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Atomically claims up to `batch_size` queued events for a worker.
    ///
    /// Selects queued rows in `(dispatched_at, id)` order with `FOR UPDATE
    /// SKIP LOCKED`, marks them `scheduled` under `worker_id`, and returns
    /// the updated rows in claim order.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NoEventsToSchedule` when no queued rows match;
    /// this is the scheduler's "skip this tick" signal, not a failure.
    pub async fn claim_batch(&self, worker_id: &str, batch_size: usize) -> Result<Vec<Event>> {
        let now = self.clock.now_utc();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM publisher_events
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
            UPDATE publisher_events
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

        // RETURNING does not preserve the select order.
        events.sort_by(|a, b| (a.dispatched_at, a.id).cmp(&(b.dispatched_at, b.id)));

        Ok(events)
    }

    /// Marks a claimed event as processed. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_processed(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publisher_events
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

    /// Marks a claimed event as failed with a reason. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(&self, event_id: EventId, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publisher_events
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

    /// Returns a claimed event to the queue after a transient send failure.
    ///
    /// Clears `worker` and `scheduled_at` so the row is claimable again in
    /// the next sweep. Terminal rows are left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reenqueue(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publisher_events
            SET status = 'queued', worker = NULL, scheduled_at = NULL, error = NULL
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(event_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Crash-recovery sweep: re-enqueues every row still scheduled under
    /// `worker_id`.
    ///
    /// Run at scheduler startup before the first claim. Rows owned by other
    /// workers are left alone.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reenqueue_worker(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE publisher_events
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
            "SELECT {COLUMNS} FROM publisher_events WHERE id = $1",
        ))
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }
}
