//! Persisted event record and strongly-typed identifiers.
//!
//! The same [`Event`] shape backs both the publisher-side
//! `publisher_events` table and the consumer-side `consumer_events` table.
//! Includes database serialization impls and the status state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed event identifier.
///
/// Wraps the producer-supplied UUID that serves as the primary key on both
/// tables and as the idempotency key across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Event lifecycle status.
///
/// Rows progress through these states under the schedulers. Transitions are
/// enforced by the stores so that terminal rows are never reclaimed:
///
/// ```text
/// queued -> scheduled -> processed
///        ^            -> failed
///        |            -> queued (transient publish failure, outbox only)
///        +-- reenqueue_worker (crash recovery)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting to be claimed by a scheduler.
    Queued,

    /// Claimed by a worker; `worker` and `scheduled_at` are set.
    ///
    /// Row-level locking in the claim guarantees a single worker observes
    /// a row in this state at any time.
    Scheduled,

    /// Dispatched (publisher side) or handled (consumer side). Terminal.
    Processed,

    /// Payload rejected, handler failed, or no handler registered. Terminal.
    Failed,

    /// Withdrawn by operator tooling. Terminal.
    ///
    /// Never set by the schedulers themselves; reserved vocabulary for
    /// out-of-band intervention.
    Discarded,
}

impl EventStatus {
    /// Returns true for states that no subsequent operation may change.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Discarded)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "queued" => Ok(Self::Queued),
            "scheduled" => Ok(Self::Scheduled),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "discarded" => Ok(Self::Discarded),
            _ => Err(format!("invalid event status: {s}").into()),
        }
    }
}

/// Persisted event record.
///
/// One row per domain event, on either side of the wire. The publisher
/// writes it in the same transaction as the business change; the consumer
/// writes it on receipt, before any handler runs.
///
/// # Idempotency
///
/// `id` is the producer-supplied primary key. A duplicate insert yields
/// `CoreError::EventAlreadyExists`; the consumer-side upsert treats the
/// duplicate as success so broker redelivery is absorbed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Globally unique identifier, supplied by the producer.
    pub id: EventId,

    /// Identity of the scheduler instance that currently holds the row.
    ///
    /// Non-null exactly while the row is `scheduled`.
    pub worker: Option<String>,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// Domain-level subject, e.g. the resource the event concerns.
    pub subject: String,

    /// Event type name, e.g. `application.created`.
    pub event_type: String,

    /// Logical producer name.
    pub source: String,

    /// URI of the JSON schema the payload conforms to.
    pub dataschema: Option<String>,

    /// Opaque JSON payload.
    pub data: serde_json::Value,

    /// Producer-side creation timestamp. Claim order key.
    pub dispatched_at: DateTime<Utc>,

    /// When the current worker claimed the row.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Terminal-state timestamp.
    pub finished_at: Option<DateTime<Utc>>,

    /// Last error string if `failed`.
    pub error: Option<String>,
}

impl Event {
    /// Creates a queued event ready for insertion.
    ///
    /// `dispatched_at` is the producer wall-clock time; the outbox insert
    /// overwrites it with the store clock, while the inbox upsert keeps the
    /// value carried on the wire.
    pub fn new(
        id: EventId,
        subject: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
        dataschema: Option<String>,
        data: serde_json::Value,
        dispatched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            worker: None,
            status: EventStatus::Queued,
            subject: subject.into(),
            event_type: event_type.into(),
            source: source.into(),
            dataschema,
            data,
            dispatched_at,
            scheduled_at: None,
            finished_at: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_database_strings() {
        assert_eq!(EventStatus::Queued.to_string(), "queued");
        assert_eq!(EventStatus::Scheduled.to_string(), "scheduled");
        assert_eq!(EventStatus::Processed.to_string(), "processed");
        assert_eq!(EventStatus::Failed.to_string(), "failed");
        assert_eq!(EventStatus::Discarded.to_string(), "discarded");
    }

    #[test]
    fn terminal_states_identified() {
        assert!(!EventStatus::Queued.is_terminal());
        assert!(!EventStatus::Scheduled.is_terminal());
        assert!(EventStatus::Processed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(EventStatus::Discarded.is_terminal());
    }

    #[test]
    fn new_event_starts_queued_with_clean_claim_fields() {
        let event = Event::new(
            EventId::new(),
            "u-42",
            "user.created",
            "accounts",
            None,
            serde_json::json!({"name": "A"}),
            Utc::now(),
        );

        assert_eq!(event.status, EventStatus::Queued);
        assert!(event.worker.is_none());
        assert!(event.scheduled_at.is_none());
        assert!(event.finished_at.is_none());
        assert!(event.error.is_none());
    }
}
