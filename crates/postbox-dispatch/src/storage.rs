//! Storage abstraction layer for the dispatch loops.
//!
//! Provides trait-based abstractions over the outbox and inbox tables so the
//! schedulers can be exercised without a database. Production implementations
//! wrap the concrete `postbox_core::storage::Storage`; tests use the doubles
//! in [`mock`].

use std::{future::Future, pin::Pin, sync::Arc};

use postbox_core::{error::Result, Event, EventId};

/// Storage operations required by the sender scheduler.
pub trait OutboxStore: Send + Sync + 'static {
    /// Claims queued outbox events for dispatch.
    ///
    /// Uses FOR UPDATE SKIP LOCKED in production so concurrent senders never
    /// claim the same rows. Claimed events transition to `scheduled` with the
    /// worker recorded on them, ordered oldest first.
    fn claim_batch(
        &self,
        worker_id: String,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>>;

    /// Marks an event as successfully published. Terminal.
    fn mark_processed(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks an event as permanently failed with a reason. Terminal.
    fn mark_failed(
        &self,
        event_id: EventId,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns a scheduled event to the queue after a transient failure.
    fn reenqueue(&self, event_id: EventId)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns every event still scheduled to `worker_id` back to the queue.
    ///
    /// Run at startup so events abandoned by a crash are picked up again.
    fn reenqueue_worker(
        &self,
        worker_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// Storage operations required by the receiver and the consumer scheduler.
pub trait InboxStore: Send + Sync + 'static {
    /// Persists an inbound event, ignoring duplicates by id.
    ///
    /// Returns `true` if the event was stored, `false` if it already existed.
    fn upsert_on_receive(
        &self,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Claims queued inbox events for handler dispatch.
    fn claim_batch(
        &self,
        worker_id: String,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>>;

    /// Marks an event as successfully handled. Terminal.
    fn mark_processed(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks an event as permanently failed with a reason. Terminal.
    fn mark_failed(
        &self,
        event_id: EventId,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns every event still scheduled to `worker_id` back to the queue.
    fn reenqueue_worker(
        &self,
        worker_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// Production outbox store backed by PostgreSQL.
pub struct PostgresOutboxStore {
    storage: Arc<postbox_core::storage::Storage>,
}

impl PostgresOutboxStore {
    /// Creates a new PostgreSQL outbox adapter.
    pub fn new(storage: Arc<postbox_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn claim_batch(
        &self,
        worker_id: String,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox.claim_batch(&worker_id, batch_size).await })
    }

    fn mark_processed(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox.mark_processed(event_id).await })
    }

    fn mark_failed(
        &self,
        event_id: EventId,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox.mark_failed(event_id, &reason).await })
    }

    fn reenqueue(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox.reenqueue(event_id).await })
    }

    fn reenqueue_worker(
        &self,
        worker_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox.reenqueue_worker(&worker_id).await })
    }
}

/// Production inbox store backed by PostgreSQL.
pub struct PostgresInboxStore {
    storage: Arc<postbox_core::storage::Storage>,
}

impl PostgresInboxStore {
    /// Creates a new PostgreSQL inbox adapter.
    pub fn new(storage: Arc<postbox_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl InboxStore for PostgresInboxStore {
    fn upsert_on_receive(
        &self,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbox.upsert_on_receive(&event).await })
    }

    fn claim_batch(
        &self,
        worker_id: String,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbox.claim_batch(&worker_id, batch_size).await })
    }

    fn mark_processed(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbox.mark_processed(event_id).await })
    }

    fn mark_failed(
        &self,
        event_id: EventId,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbox.mark_failed(event_id, &reason).await })
    }

    fn reenqueue_worker(
        &self,
        worker_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbox.reenqueue_worker(&worker_id).await })
    }
}

pub mod mock {
    //! Mock store implementations for testing.
    //!
    //! In-memory state with the same status transition guards as the
    //! PostgreSQL repositories, plus error injection for exercising the
    //! schedulers' failure paths.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::Utc;
    use postbox_core::{
        error::{CoreError, Result},
        Event, EventId, EventStatus,
    };
    use tokio::sync::RwLock;

    use super::{InboxStore, OutboxStore};

    #[derive(Default)]
    struct MockState {
        events: HashMap<EventId, Event>,
        claim_error: Option<String>,
    }

    impl MockState {
        fn claim(&mut self, worker_id: &str, batch_size: usize) -> Result<Vec<Event>> {
            if let Some(error) = self.claim_error.take() {
                return Err(CoreError::Database(error));
            }

            let mut queued: Vec<&Event> =
                self.events.values().filter(|e| e.status == EventStatus::Queued).collect();
            queued.sort_by(|a, b| (a.dispatched_at, a.id).cmp(&(b.dispatched_at, b.id)));
            let ids: Vec<EventId> = queued.iter().take(batch_size).map(|e| e.id).collect();

            if ids.is_empty() {
                return Err(CoreError::NoEventsToSchedule);
            }

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(event) = self.events.get_mut(&id) {
                    event.status = EventStatus::Scheduled;
                    event.worker = Some(worker_id.to_string());
                    event.scheduled_at = Some(Utc::now());
                    claimed.push(event.clone());
                }
            }
            Ok(claimed)
        }

        fn finish(&mut self, event_id: EventId, status: EventStatus, error: Option<String>) {
            if let Some(event) = self.events.get_mut(&event_id) {
                if event.status != EventStatus::Scheduled {
                    return;
                }
                event.status = status;
                event.finished_at = Some(Utc::now());
                event.error = error;
            }
        }

        fn reenqueue(&mut self, event_id: EventId) {
            if let Some(event) = self.events.get_mut(&event_id) {
                if event.status != EventStatus::Scheduled {
                    return;
                }
                event.status = EventStatus::Queued;
                event.worker = None;
                event.scheduled_at = None;
                event.error = None;
            }
        }

        fn reenqueue_worker(&mut self, worker_id: &str) -> u64 {
            let ids: Vec<EventId> = self
                .events
                .values()
                .filter(|e| {
                    e.status == EventStatus::Scheduled && e.worker.as_deref() == Some(worker_id)
                })
                .map(|e| e.id)
                .collect();
            let count = ids.len() as u64;
            for id in ids {
                self.reenqueue(id);
            }
            count
        }
    }

    /// Mock outbox store for testing the sender without a database.
    #[derive(Default)]
    pub struct MockOutboxStore {
        state: Arc<RwLock<MockState>>,
    }

    impl MockOutboxStore {
        /// Creates a mock store with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds an event in its current state, whatever its status.
        pub async fn seed(&self, event: Event) {
            self.state.write().await.events.insert(event.id, event);
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            self.state.write().await.claim_error = Some(error.into());
        }

        /// Returns the stored copy of an event for verification.
        pub async fn event(&self, event_id: EventId) -> Option<Event> {
            self.state.read().await.events.get(&event_id).cloned()
        }

        /// Returns true if the event reached the expected status.
        pub async fn verify_status(&self, event_id: EventId, expected: EventStatus) -> bool {
            self.state.read().await.events.get(&event_id).is_some_and(|e| e.status == expected)
        }
    }

    impl OutboxStore for MockOutboxStore {
        fn claim_batch(
            &self,
            worker_id: String,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move { state.write().await.claim(&worker_id, batch_size) })
        }

        fn mark_processed(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move {
                state.write().await.finish(event_id, EventStatus::Processed, None);
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            event_id: EventId,
            reason: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move {
                state.write().await.finish(event_id, EventStatus::Failed, Some(reason));
                Ok(())
            })
        }

        fn reenqueue(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move {
                state.write().await.reenqueue(event_id);
                Ok(())
            })
        }

        fn reenqueue_worker(
            &self,
            worker_id: String,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move { Ok(state.write().await.reenqueue_worker(&worker_id)) })
        }
    }

    /// Mock inbox store for testing the consumer and receiver.
    #[derive(Default)]
    pub struct MockInboxStore {
        state: Arc<RwLock<MockState>>,
    }

    impl MockInboxStore {
        /// Creates a mock store with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds an event in its current state, whatever its status.
        pub async fn seed(&self, event: Event) {
            self.state.write().await.events.insert(event.id, event);
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            self.state.write().await.claim_error = Some(error.into());
        }

        /// Returns the stored copy of an event for verification.
        pub async fn event(&self, event_id: EventId) -> Option<Event> {
            self.state.read().await.events.get(&event_id).cloned()
        }

        /// Number of events currently stored.
        pub async fn len(&self) -> usize {
            self.state.read().await.events.len()
        }

        /// Returns true if no events are stored.
        pub async fn is_empty(&self) -> bool {
            self.state.read().await.events.is_empty()
        }

        /// Returns true if the event reached the expected status.
        pub async fn verify_status(&self, event_id: EventId, expected: EventStatus) -> bool {
            self.state.read().await.events.get(&event_id).is_some_and(|e| e.status == expected)
        }
    }

    impl InboxStore for MockInboxStore {
        fn upsert_on_receive(
            &self,
            event: Event,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                if state.events.contains_key(&event.id) {
                    return Ok(false);
                }
                state.events.insert(event.id, event);
                Ok(true)
            })
        }

        fn claim_batch(
            &self,
            worker_id: String,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move { state.write().await.claim(&worker_id, batch_size) })
        }

        fn mark_processed(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move {
                state.write().await.finish(event_id, EventStatus::Processed, None);
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            event_id: EventId,
            reason: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move {
                state.write().await.finish(event_id, EventStatus::Failed, Some(reason));
                Ok(())
            })
        }

        fn reenqueue_worker(
            &self,
            worker_id: String,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let state = self.state.clone();
            Box::pin(async move { Ok(state.write().await.reenqueue_worker(&worker_id)) })
        }
    }
}
