//! Error types for the dispatch loops.

use std::time::Duration;

use postbox_broker::BrokerError;
use postbox_core::CoreError;
use thiserror::Error;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that stop a scheduler or receiver.
///
/// Per-event failures never surface here; they are recorded on the event row
/// and the loop continues. These variants cover the fatal cases.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Startup recovery of a worker's abandoned events failed.
    #[error("failed to recover events for worker {worker_id}: {source}")]
    Recovery {
        /// Stable identity of the worker whose events could not be recovered.
        worker_id: String,
        /// Underlying storage error.
        source: CoreError,
    },

    /// Workers did not finish within the shutdown grace period.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Storage failure that is not attributable to a single event.
    #[error(transparent)]
    Store(#[from] CoreError),

    /// Broker failure outside the per-event dispatch path.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
