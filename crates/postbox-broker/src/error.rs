//! Error types for broker operations.
//!
//! The taxonomy drives the outbox failure classification: an `Encode` error
//! means the payload itself is broken and retrying cannot help, while
//! transport-level failures are transient and the event is re-enqueued.

use thiserror::Error;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by broker adapters.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The event payload could not be encoded for the wire. Terminal.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The broker or network rejected the operation. Transient.
    #[error("transport error: {0}")]
    Transport(String),

    /// The subscription could not be established or was lost.
    #[error("subscription error: {0}")]
    Subscribe(String),
}

impl BrokerError {
    /// Returns whether retrying the operation may succeed.
    ///
    /// Transient errors re-enqueue the event; an encode failure marks it
    /// failed because the payload is structurally unrecoverable.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Subscribe(_))
    }

    /// Creates a transport error from a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a subscription error from a message.
    pub fn subscribe(message: impl Into<String>) -> Self {
        Self::Subscribe(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::transport("connection reset").is_transient());
        assert!(BrokerError::subscribe("consumer deleted").is_transient());

        let encode = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert!(!BrokerError::Encode(encode).is_transient());
    }
}
