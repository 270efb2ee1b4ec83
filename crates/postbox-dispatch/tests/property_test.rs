//! Property-based tests for the dispatch storage abstraction.
//!
//! Drives random operation sequences against the mock stores and checks the
//! lifecycle invariants the schedulers rely on: terminal states never change,
//! and status always agrees with the worker and timestamp columns.

use std::sync::Arc;

use chrono::Utc;
use postbox_core::{Event, EventId, EventStatus};
use postbox_dispatch::{
    storage::mock::{MockInboxStore, MockOutboxStore},
    InboxStore, OutboxStore,
};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Op {
    Claim,
    MarkProcessed(usize),
    MarkFailed(usize),
    Reenqueue(usize),
    RecoverWorker,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Claim),
        (0usize..8).prop_map(Op::MarkProcessed),
        (0usize..8).prop_map(Op::MarkFailed),
        (0usize..8).prop_map(Op::Reenqueue),
        Just(Op::RecoverWorker),
    ]
}

fn seed_events(count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            Event::new(
                EventId(Uuid::new_v4()),
                format!("subject-{i}"),
                "thing.happened".to_string(),
                "tests".to_string(),
                None,
                json!({"n": i}),
                Utc::now(),
            )
        })
        .collect()
}

fn check_invariants(event: &Event) {
    match event.status {
        EventStatus::Queued => {
            assert!(event.worker.is_none(), "queued event must have no worker");
            assert!(event.scheduled_at.is_none(), "queued event must have no schedule time");
            assert!(event.error.is_none(), "queued event must have no error");
        }
        EventStatus::Scheduled => {
            assert!(event.worker.is_some(), "scheduled event must carry its worker");
            assert!(event.scheduled_at.is_some(), "scheduled event must carry a schedule time");
        }
        EventStatus::Processed => {
            assert!(event.finished_at.is_some(), "processed event must carry a finish time");
            assert!(event.error.is_none(), "processed event must have no error");
        }
        EventStatus::Failed => {
            assert!(event.finished_at.is_some(), "failed event must carry a finish time");
        }
        EventStatus::Discarded => {}
    }
}

proptest! {
    /// Terminal events never change status again, whatever happens next.
    #[test]
    fn outbox_terminal_states_are_immutable(
        ops in prop::collection::vec(op_strategy(), 1..60),
        event_count in 1usize..8,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(MockOutboxStore::new());
            let events = seed_events(event_count);
            let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
            for event in events {
                store.seed(event).await;
            }

            let mut terminal: Vec<(EventId, EventStatus)> = Vec::new();

            for op in ops {
                match op {
                    Op::Claim => {
                        // Empty claims surface as a sentinel error.
                        let _ = store.claim_batch("w1".to_string(), 3).await;
                    }
                    Op::MarkProcessed(i) => {
                        let id = ids[i % ids.len()];
                        store.mark_processed(id).await.unwrap();
                    }
                    Op::MarkFailed(i) => {
                        let id = ids[i % ids.len()];
                        store.mark_failed(id, "boom".to_string()).await.unwrap();
                    }
                    Op::Reenqueue(i) => {
                        let id = ids[i % ids.len()];
                        store.reenqueue(id).await.unwrap();
                    }
                    Op::RecoverWorker => {
                        store.reenqueue_worker("w1".to_string()).await.unwrap();
                    }
                }

                for &(id, status) in &terminal {
                    let event = store.event(id).await.unwrap();
                    prop_assert_eq!(event.status, status, "terminal event changed status");
                }

                for &id in &ids {
                    let event = store.event(id).await.unwrap();
                    check_invariants(&event);
                    if event.status.is_terminal()
                        && !terminal.iter().any(|(tid, _)| *tid == id)
                    {
                        terminal.push((id, event.status));
                    }
                }
            }
            Ok(())
        })?;
    }

    /// Upserting the same id any number of times stores exactly one row, and
    /// later upserts never disturb its lifecycle.
    #[test]
    fn inbox_upsert_is_idempotent_by_id(
        redeliveries in 1usize..10,
        finish_processed in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(MockInboxStore::new());
            let event = seed_events(1).remove(0);
            let id = event.id;

            prop_assert!(store.upsert_on_receive(event.clone()).await.unwrap());

            // Move the row through its lifecycle.
            store.claim_batch("c1".to_string(), 1).await.unwrap();
            if finish_processed {
                store.mark_processed(id).await.unwrap();
            } else {
                store.mark_failed(id, "boom".to_string()).await.unwrap();
            }
            let settled = store.event(id).await.unwrap().status;

            for _ in 0..redeliveries {
                prop_assert!(!store.upsert_on_receive(event.clone()).await.unwrap());
            }

            prop_assert_eq!(store.len().await, 1);
            prop_assert_eq!(store.event(id).await.unwrap().status, settled);
            Ok(())
        })?;
    }
}
