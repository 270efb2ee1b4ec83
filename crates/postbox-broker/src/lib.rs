//! Message broker adapter for event relay.
//!
//! Defines the [`Broker`] and [`Subscriber`] seams the dispatch loops run
//! against, the [`CloudEvent`] wire envelope, and the NATS JetStream
//! implementation of both. Mock implementations live in [`mock`] for tests
//! that must not touch a real broker.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod mock;
pub mod nats;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use envelope::{CloudEvent, CONTENT_TYPE_JSON, SPEC_VERSION};
pub use error::{BrokerError, Result};
pub use nats::{NatsBroker, NatsSubscriber};

/// Error type surfaced by inbound callbacks.
///
/// A callback failure leaves the message unacknowledged so the broker
/// redelivers it.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Handler invoked for every decoded inbound envelope.
pub type InboundCallback = Arc<
    dyn Fn(CloudEvent) -> Pin<Box<dyn Future<Output = std::result::Result<(), CallbackError>> + Send>>
        + Send
        + Sync,
>;

/// Outbound publishing seam.
///
/// Implementations must only return `Ok` once the broker has accepted the
/// message; at-least-once delivery depends on it.
pub trait Broker: Send + Sync + 'static {
    /// Publishes one envelope to the broker.
    fn publish(&self, event: CloudEvent) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Inbound subscription seam.
///
/// `run` consumes messages until the token is cancelled, invoking the
/// callback for each decoded envelope and acknowledging only after the
/// callback succeeds.
pub trait Subscriber: Send + Sync + 'static {
    /// Runs the subscription loop to completion.
    fn run(
        &self,
        callback: InboundCallback,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
