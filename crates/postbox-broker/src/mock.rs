//! In-memory broker doubles for tests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::CloudEvent;
use crate::error::{BrokerError, Result};
use crate::{Broker, InboundCallback, Subscriber};

/// Broker double that records publishes and fails on demand.
///
/// Scripted errors are consumed in order, one per `publish` call; once the
/// script is drained every publish succeeds and is recorded.
#[derive(Debug, Default)]
pub struct MockBroker {
    published: Mutex<Vec<CloudEvent>>,
    scripted_errors: Mutex<VecDeque<BrokerError>>,
}

impl MockBroker {
    /// Creates a broker that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error to be returned by the next unscripted `publish`.
    pub fn push_error(&self, error: BrokerError) {
        self.scripted_errors.lock().unwrap().push_back(error);
    }

    /// Queues `n` transient transport failures.
    pub fn fail_times(&self, n: usize) {
        let mut errors = self.scripted_errors.lock().unwrap();
        for _ in 0..n {
            errors.push_back(BrokerError::transport("injected failure"));
        }
    }

    /// Envelopes accepted so far, in publish order.
    pub fn published(&self) -> Vec<CloudEvent> {
        self.published.lock().unwrap().clone()
    }

    /// Number of envelopes accepted so far.
    pub fn published_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

impl Broker for MockBroker {
    fn publish(&self, event: CloudEvent) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(error) = self.scripted_errors.lock().unwrap().pop_front() {
                return Err(error);
            }
            self.published.lock().unwrap().push(event);
            Ok(())
        })
    }
}

/// Subscriber double fed through an in-process channel.
///
/// Tests push envelopes into the sender half; `run` forwards each one to the
/// callback and records whether it was acked or left for redelivery.
pub struct MockSubscriber {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<CloudEvent>>>,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
}

impl MockSubscriber {
    /// Creates the subscriber and the channel tests feed it through.
    pub fn new() -> (Self, mpsc::UnboundedSender<CloudEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Self {
            receiver: Mutex::new(Some(rx)),
            acked: Mutex::new(Vec::new()),
            nacked: Mutex::new(Vec::new()),
        };
        (subscriber, tx)
    }

    /// Ids of envelopes the callback accepted.
    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    /// Ids of envelopes the callback rejected.
    pub fn nacked(&self) -> Vec<String> {
        self.nacked.lock().unwrap().clone()
    }
}

impl Subscriber for MockSubscriber {
    fn run(
        &self,
        callback: InboundCallback,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut receiver = self
                .receiver
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| BrokerError::subscribe("subscriber already running"))?;

            loop {
                let envelope = tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    next = receiver.recv() => match next {
                        Some(envelope) => envelope,
                        None => return Ok(()),
                    },
                };

                let event_id = envelope.id.clone();
                match callback(envelope).await {
                    Ok(()) => self.acked.lock().unwrap().push(event_id),
                    Err(_) => self.nacked.lock().unwrap().push(event_id),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::envelope::{CONTENT_TYPE_JSON, SPEC_VERSION};

    fn envelope(id: &str) -> CloudEvent {
        CloudEvent {
            specversion: SPEC_VERSION.to_string(),
            id: id.to_string(),
            source: "tests".to_string(),
            event_type: "thing.happened".to_string(),
            subject: None,
            time: Utc::now(),
            dataschema: None,
            datacontenttype: CONTENT_TYPE_JSON.to_string(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn scripted_errors_drain_before_publishes_succeed() {
        let broker = MockBroker::new();
        broker.fail_times(2);

        assert!(broker.publish(envelope("a")).await.is_err());
        assert!(broker.publish(envelope("b")).await.is_err());
        assert!(broker.publish(envelope("c")).await.is_ok());

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, "c");
    }

    #[tokio::test]
    async fn subscriber_records_ack_outcome_per_envelope() {
        let (subscriber, tx) = MockSubscriber::new();
        let cancel = CancellationToken::new();

        tx.send(envelope("ok")).unwrap();
        tx.send(envelope("bad")).unwrap();
        drop(tx);

        let callback: InboundCallback = Arc::new(|event: CloudEvent| {
            Box::pin(async move {
                if event.id == "bad" {
                    Err("rejected".into())
                } else {
                    Ok(())
                }
            })
        });

        subscriber.run(callback, cancel).await.unwrap();

        assert_eq!(subscriber.acked(), vec!["ok".to_string()]);
        assert_eq!(subscriber.nacked(), vec!["bad".to_string()]);
    }
}
