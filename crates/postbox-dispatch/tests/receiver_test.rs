//! Integration tests for the inbound receiver over a mock subscription.

use std::{str::FromStr, sync::Arc};

use chrono::{TimeZone, Utc};
use postbox_broker::{mock::MockSubscriber, CloudEvent, CONTENT_TYPE_JSON, SPEC_VERSION};
use postbox_core::{EventId, EventStatus};
use postbox_dispatch::{storage::mock::MockInboxStore, Receiver};
use serde_json::json;
use uuid::Uuid;

fn envelope(id: &str) -> CloudEvent {
    CloudEvent {
        specversion: SPEC_VERSION.to_string(),
        id: id.to_string(),
        source: "accounts".to_string(),
        event_type: "user.created".to_string(),
        subject: Some("u-42".to_string()),
        time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        dataschema: None,
        datacontenttype: CONTENT_TYPE_JSON.to_string(),
        data: json!({"name": "A"}),
    }
}

#[tokio::test]
async fn inbound_event_is_persisted_before_ack() {
    let store = Arc::new(MockInboxStore::new());
    let (subscriber, tx) = MockSubscriber::new();
    let subscriber = Arc::new(subscriber);

    tx.send(envelope("11111111-1111-1111-1111-111111111111")).unwrap();
    drop(tx);

    let receiver = Receiver::new(store.clone(), subscriber.clone());
    receiver.run().await.unwrap();

    let id = EventId(Uuid::from_str("11111111-1111-1111-1111-111111111111").unwrap());
    let stored = store.event(id).await.unwrap();
    assert_eq!(stored.status, EventStatus::Queued);
    assert_eq!(stored.event_type, "user.created");
    assert_eq!(stored.subject, "u-42");
    assert_eq!(stored.source, "accounts");
    assert_eq!(stored.data, json!({"name": "A"}));
    // Row carries the producer's dispatch time, not the receive time.
    assert_eq!(stored.dispatched_at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    assert!(stored.worker.is_none());

    assert_eq!(subscriber.acked().len(), 1);
    assert!(subscriber.nacked().is_empty());
}

#[tokio::test]
async fn duplicate_delivery_is_acked_but_stored_once() {
    let store = Arc::new(MockInboxStore::new());
    let (subscriber, tx) = MockSubscriber::new();
    let subscriber = Arc::new(subscriber);

    tx.send(envelope("22222222-2222-2222-2222-222222222222")).unwrap();
    tx.send(envelope("22222222-2222-2222-2222-222222222222")).unwrap();
    drop(tx);

    let receiver = Receiver::new(store.clone(), subscriber.clone());
    receiver.run().await.unwrap();

    assert_eq!(store.len().await, 1);
    // Both deliveries are acked; redelivering a stored event is success.
    assert_eq!(subscriber.acked().len(), 2);
}

#[tokio::test]
async fn redelivery_never_overwrites_a_processed_row() {
    let store = Arc::new(MockInboxStore::new());
    let (subscriber, tx) = MockSubscriber::new();
    let subscriber = Arc::new(subscriber);

    let id = EventId(Uuid::from_str("33333333-3333-3333-3333-333333333333").unwrap());

    // The row already went through the consumer.
    let mut processed = postbox_core::Event::new(
        id,
        "u-42".to_string(),
        "user.created".to_string(),
        "accounts".to_string(),
        None,
        json!({}),
        Utc::now(),
    );
    processed.status = EventStatus::Processed;
    processed.finished_at = Some(Utc::now());
    store.seed(processed).await;

    tx.send(envelope("33333333-3333-3333-3333-333333333333")).unwrap();
    drop(tx);

    let receiver = Receiver::new(store.clone(), subscriber.clone());
    receiver.run().await.unwrap();

    assert!(store.verify_status(id, EventStatus::Processed).await);
    assert_eq!(subscriber.acked().len(), 1);
}

#[tokio::test]
async fn malformed_event_id_is_dropped_with_an_ack() {
    let store = Arc::new(MockInboxStore::new());
    let (subscriber, tx) = MockSubscriber::new();
    let subscriber = Arc::new(subscriber);

    tx.send(envelope("not-a-uuid")).unwrap();
    drop(tx);

    let receiver = Receiver::new(store.clone(), subscriber.clone());
    receiver.run().await.unwrap();

    assert!(store.is_empty().await);
    assert_eq!(subscriber.acked().len(), 1);
}
