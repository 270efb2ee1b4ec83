//! NATS JetStream implementations of [`Broker`] and [`Subscriber`].

use async_nats::jetstream::{self, consumer, stream, AckKind, Context};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::envelope::CloudEvent;
use crate::error::{BrokerError, Result};
use crate::{Broker, InboundCallback, Subscriber};
use std::future::Future;
use std::pin::Pin;

/// Publishes envelopes to a JetStream subject.
#[derive(Debug, Clone)]
pub struct NatsBroker {
    context: Context,
    subject: String,
}

impl NatsBroker {
    /// Connects to the NATS server and binds outbound publishing to
    /// `subject`.
    pub async fn connect(url: &str, subject: impl Into<String>) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::transport(e.to_string()))?;

        Ok(Self {
            context: jetstream::new(client),
            subject: subject.into(),
        })
    }

    /// Builds a broker on an existing JetStream context.
    pub fn new(context: Context, subject: impl Into<String>) -> Self {
        Self {
            context,
            subject: subject.into(),
        }
    }
}

impl Broker for NatsBroker {
    fn publish(&self, event: CloudEvent) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let bytes = event.to_bytes()?;

            // Double await: the second waits for the JetStream ack, so Ok
            // means the stream has persisted the message.
            let ack = self
                .context
                .publish(self.subject.clone(), bytes.into())
                .await
                .map_err(|e| BrokerError::transport(e.to_string()))?;
            ack.await
                .map_err(|e| BrokerError::transport(e.to_string()))?;

            debug!(event_id = %event.id, subject = %self.subject, "published event");
            Ok(())
        })
    }
}

/// Pulls envelopes from a durable JetStream consumer.
#[derive(Debug, Clone)]
pub struct NatsSubscriber {
    context: Context,
    stream_name: String,
    subject: String,
    durable_name: String,
}

impl NatsSubscriber {
    /// Connects to the NATS server and prepares a durable pull consumer on
    /// `stream_name`/`subject`.
    pub async fn connect(
        url: &str,
        stream_name: impl Into<String>,
        subject: impl Into<String>,
        durable_name: impl Into<String>,
    ) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::transport(e.to_string()))?;

        Ok(Self {
            context: jetstream::new(client),
            stream_name: stream_name.into(),
            subject: subject.into(),
            durable_name: durable_name.into(),
        })
    }

    async fn pull_consumer(&self) -> Result<consumer::Consumer<consumer::pull::Config>> {
        let stream = self
            .context
            .get_or_create_stream(stream::Config {
                name: self.stream_name.clone(),
                subjects: vec![self.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::subscribe(e.to_string()))?;

        stream
            .get_or_create_consumer(
                &self.durable_name,
                consumer::pull::Config {
                    durable_name: Some(self.durable_name.clone()),
                    filter_subject: self.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::subscribe(e.to_string()))
    }
}

impl Subscriber for NatsSubscriber {
    fn run(
        &self,
        callback: InboundCallback,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let consumer = self.pull_consumer().await?;
            let mut messages = consumer
                .messages()
                .await
                .map_err(|e| BrokerError::subscribe(e.to_string()))?;

            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(stream = %self.stream_name, "subscription cancelled");
                        return Ok(());
                    }
                    next = messages.next() => match next {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!(error = %e, "message stream error");
                            continue;
                        }
                        None => return Err(BrokerError::subscribe("message stream closed")),
                    },
                };

                let envelope = match CloudEvent::from_bytes(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        // Undecodable payloads can never succeed; terminate
                        // redelivery instead of poisoning the consumer.
                        error!(error = %e, "discarding undecodable message");
                        if let Err(e) = message.ack_with(AckKind::Term).await {
                            warn!(error = %e, "failed to terminate message");
                        }
                        continue;
                    }
                };

                let event_id = envelope.id.clone();
                match callback(envelope).await {
                    Ok(()) => {
                        if let Err(e) = message.ack().await {
                            warn!(event_id = %event_id, error = %e, "failed to ack message");
                        }
                    }
                    Err(e) => {
                        // Leave unacked so JetStream redelivers.
                        warn!(event_id = %event_id, error = %e, "inbound callback failed");
                    }
                }
            }
        })
    }
}
