//! PostgreSQL integration tests for the outbox and inbox repositories.
//!
//! These need a running database; set `DATABASE_URL` and run with
//! `cargo test -- --ignored`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use postbox_core::{
    error::CoreError, storage::Storage, Event, EventId, EventStatus, RealClock,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

async fn test_storage() -> Result<Storage> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    Ok(Storage::new(pool, Arc::new(RealClock)))
}

fn sample_event() -> Event {
    Event::new(
        EventId::new(),
        "u-42",
        "user.created",
        "accounts",
        None,
        json!({"name": "A"}),
        Utc::now(),
    )
}

#[tokio::test]
#[ignore = "needs PostgreSQL via DATABASE_URL"]
async fn health_check_passes_on_a_live_pool() -> Result<()> {
    let storage = test_storage().await?;
    storage.health_check().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs PostgreSQL via DATABASE_URL"]
async fn duplicate_outbox_insert_is_rejected() -> Result<()> {
    let storage = test_storage().await?;
    let event = sample_event();

    let mut tx = storage.pool().begin().await?;
    storage.outbox.insert(&mut tx, &event).await?;
    tx.commit().await?;

    let mut tx = storage.pool().begin().await?;
    let err = storage.outbox.insert(&mut tx, &event).await.unwrap_err();
    assert!(matches!(err, CoreError::EventAlreadyExists));
    Ok(())
}

#[tokio::test]
#[ignore = "needs PostgreSQL via DATABASE_URL"]
async fn concurrent_claims_are_disjoint() -> Result<()> {
    let storage = Arc::new(test_storage().await?);

    let mut ids = Vec::new();
    let mut tx = storage.pool().begin().await?;
    for _ in 0..20 {
        let event = sample_event();
        ids.push(event.id);
        storage.outbox.insert(&mut tx, &event).await?;
    }
    tx.commit().await?;

    let a = {
        let storage = storage.clone();
        tokio::spawn(async move { storage.outbox.claim_batch("worker-a", 10).await })
    };
    let b = {
        let storage = storage.clone();
        tokio::spawn(async move { storage.outbox.claim_batch("worker-b", 10).await })
    };

    let claimed_a = a.await??;
    let claimed_b = b.await??;

    for event in &claimed_a {
        assert_eq!(event.status, EventStatus::Scheduled);
        assert!(
            !claimed_b.iter().any(|other| other.id == event.id),
            "event {} claimed by both workers",
            event.id
        );
    }
    Ok(())
}

#[tokio::test]
#[ignore = "needs PostgreSQL via DATABASE_URL"]
async fn claimed_events_come_back_oldest_first() -> Result<()> {
    let storage = test_storage().await?;

    let mut tx = storage.pool().begin().await?;
    let mut inserted = Vec::new();
    for _ in 0..5 {
        let event = sample_event();
        inserted.push(event.id);
        storage.outbox.insert(&mut tx, &event).await?;
    }
    tx.commit().await?;

    let claimed = storage.outbox.claim_batch("worker-order", 100).await?;
    let times: Vec<_> = claimed.iter().map(|e| (e.dispatched_at, e.id)).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
    Ok(())
}

#[tokio::test]
#[ignore = "needs PostgreSQL via DATABASE_URL"]
async fn reenqueue_worker_clears_claim_fields() -> Result<()> {
    let storage = test_storage().await?;
    let event = sample_event();
    let id = event.id;

    let mut tx = storage.pool().begin().await?;
    storage.outbox.insert(&mut tx, &event).await?;
    tx.commit().await?;

    let claimed = storage.outbox.claim_batch("worker-crashed", 150).await?;
    assert!(claimed.iter().any(|e| e.id == id));

    let recovered = storage.outbox.reenqueue_worker("worker-crashed").await?;
    assert!(recovered >= 1);

    let row = storage.outbox.find_by_id(id).await?.context("row missing")?;
    assert_eq!(row.status, EventStatus::Queued);
    assert!(row.worker.is_none());
    assert!(row.scheduled_at.is_none());
    assert!(row.error.is_none());
    Ok(())
}

#[tokio::test]
#[ignore = "needs PostgreSQL via DATABASE_URL"]
async fn terminal_outbox_rows_resist_further_transitions() -> Result<()> {
    let storage = test_storage().await?;
    let event = sample_event();
    let id = event.id;

    let mut tx = storage.pool().begin().await?;
    storage.outbox.insert(&mut tx, &event).await?;
    tx.commit().await?;

    storage.outbox.claim_batch("worker-terminal", 150).await?;
    storage.outbox.mark_processed(id).await?;

    // Guarded updates are no-ops on terminal rows.
    storage.outbox.mark_failed(id, "late failure").await?;
    storage.outbox.reenqueue(id).await?;
    storage.outbox.reenqueue_worker("worker-terminal").await?;

    let row = storage.outbox.find_by_id(id).await?.context("row missing")?;
    assert_eq!(row.status, EventStatus::Processed);
    assert!(row.error.is_none());
    Ok(())
}

#[tokio::test]
#[ignore = "needs PostgreSQL via DATABASE_URL"]
async fn inbox_upsert_absorbs_redelivery() -> Result<()> {
    let storage = test_storage().await?;
    let event = sample_event();
    let id = event.id;

    assert!(storage.inbox.upsert_on_receive(&event).await?);
    assert!(!storage.inbox.upsert_on_receive(&event).await?);

    let row = storage.inbox.find_by_id(id).await?.context("row missing")?;
    assert_eq!(row.status, EventStatus::Queued);
    // The wire timestamp is preserved, not replaced by the store clock.
    assert_eq!(
        row.dispatched_at.timestamp_millis(),
        event.dispatched_at.timestamp_millis()
    );
    Ok(())
}
