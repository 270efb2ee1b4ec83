//! Inbound receiver: persists broker messages into the inbox.
//!
//! The durability handshake: a message is acknowledged to the broker only
//! after its event row is committed. A crash between commit and ack causes a
//! redelivery, which the id-keyed upsert absorbs.

use std::{str::FromStr, sync::Arc};

use postbox_broker::{CallbackError, CloudEvent, InboundCallback, Subscriber};
use postbox_core::{Event, EventId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::Result, storage::InboxStore};

/// Long-lived subscription that writes inbound events to the inbox.
pub struct Receiver {
    inbox: Arc<dyn InboxStore>,
    subscriber: Arc<dyn Subscriber>,
    cancel: CancellationToken,
}

impl Receiver {
    /// Creates a receiver over the given store and subscription.
    pub fn new(inbox: Arc<dyn InboxStore>, subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            inbox,
            subscriber,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the subscription when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the subscription until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription itself fails. Per-message failures
    /// leave the message unacked for redelivery.
    pub async fn run(&self) -> Result<()> {
        let inbox = self.inbox.clone();
        let callback: InboundCallback = Arc::new(move |envelope: CloudEvent| {
            let inbox = inbox.clone();
            Box::pin(async move { persist_envelope(inbox, envelope).await })
        });

        self.subscriber.run(callback, self.cancel.clone()).await?;
        Ok(())
    }
}

/// Stores one inbound envelope, treating duplicates as success.
async fn persist_envelope(
    inbox: Arc<dyn InboxStore>,
    envelope: CloudEvent,
) -> std::result::Result<(), CallbackError> {
    let id = match Uuid::from_str(&envelope.id) {
        Ok(id) => id,
        Err(error) => {
            // A malformed id can never be stored; ack it away rather than
            // looping on redelivery.
            warn!(event_id = %envelope.id, error = %error, "dropping event with invalid id");
            return Ok(());
        }
    };

    let event = Event::new(
        EventId(id),
        envelope.subject.unwrap_or_default(),
        envelope.event_type,
        envelope.source,
        envelope.dataschema,
        envelope.data,
        // Producer-side creation time, so inbox ordering follows the
        // original dispatch order.
        envelope.time,
    );

    match inbox.upsert_on_receive(event).await {
        Ok(true) => {
            debug!(event_id = %id, "inbound event stored");
            Ok(())
        }
        Ok(false) => {
            debug!(event_id = %id, "duplicate inbound event ignored");
            Ok(())
        }
        Err(error) => {
            // No ack: the broker will redeliver once storage recovers.
            warn!(event_id = %id, error = %error, "failed to store inbound event");
            Err(Box::new(error) as CallbackError)
        }
    }
}
