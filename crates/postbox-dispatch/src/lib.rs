//! Dispatch loops for the transactional outbox and inbox.
//!
//! Three long-running pieces share this crate:
//!
//! - [`Sender`] claims queued outbox events and publishes them to the broker.
//! - [`Receiver`] persists inbound broker messages into the inbox before
//!   acknowledging them.
//! - [`Consumer`] claims queued inbox events and runs the registered
//!   application handlers.
//!
//! All three are crash-safe: events are claimed with a stable worker
//! identity, and a startup sweep returns anything a dead instance left
//! behind to the queue.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod error;
pub mod handler;
pub mod receiver;
pub mod sender;
pub mod storage;

use std::time::Duration;

pub use consumer::{Consumer, ConsumerConfig};
pub use error::{DispatchError, Result};
pub use handler::{handler_fn, Handler, HandlerRegistry};
pub use receiver::Receiver;
pub use sender::{Sender, SenderConfig};
pub use storage::{InboxStore, OutboxStore, PostgresInboxStore, PostgresOutboxStore};

/// Default interval between polls of an empty table.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(500);

/// Default upper bound on dispatching one claimed batch.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_millis(400);

/// Default maximum events claimed per sweep.
pub const DEFAULT_BATCH_SIZE: usize = 150;

/// Default grace period for in-flight work during shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
