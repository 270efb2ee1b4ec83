//! Error types and result handling for store operations.
//!
//! Two variants are sentinels that callers are expected to match on:
//! [`CoreError::EventAlreadyExists`] signals a duplicate insert, and
//! [`CoreError::NoEventsToSchedule`] signals an empty claim sweep. Both are
//! normal control flow, not failures.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for event store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An event with the same `id` is already persisted.
    ///
    /// Publisher-side callers use this to distinguish a first write from a
    /// replay. The consumer-side upsert absorbs it as idempotent success.
    #[error("event already exists")]
    EventAlreadyExists,

    /// A claim sweep matched no queued rows.
    ///
    /// Schedulers treat this as "skip this tick".
    #[error("no events to schedule")]
    NoEventsToSchedule,

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),
}

impl CoreError {
    /// Returns true for the sentinel variants that represent normal control
    /// flow rather than failures.
    pub const fn is_sentinel(&self) -> bool {
        matches!(self, Self::EventAlreadyExists | Self::NoEventsToSchedule)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested event not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::EventAlreadyExists
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_classified() {
        assert!(CoreError::EventAlreadyExists.is_sentinel());
        assert!(CoreError::NoEventsToSchedule.is_sentinel());
        assert!(!CoreError::Database("boom".to_string()).is_sentinel());
        assert!(!CoreError::NotFound("x".to_string()).is_sentinel());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
