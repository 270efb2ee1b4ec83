//! Core domain model and durable stores for the transactional event
//! outbox/inbox.
//!
//! Provides the persisted [`models::Event`] record shared by both sides of
//! the wire, the error taxonomy with the `EventAlreadyExists` and
//! `NoEventsToSchedule` sentinels, a clock abstraction for deterministic
//! tests, and the PostgreSQL repositories for the `publisher_events` and
//! `consumer_events` tables.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{Event, EventId, EventStatus};
pub use time::{Clock, RealClock, TestClock};
