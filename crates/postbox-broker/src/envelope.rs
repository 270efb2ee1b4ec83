//! CloudEvents v1.0 envelope carried on the wire.
//!
//! JSON structured mode only; the transport below it is an adapter detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// CloudEvents spec version emitted and accepted by this crate.
pub const SPEC_VERSION: &str = "1.0";

/// Content type stamped on every envelope; payloads are always JSON.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A CloudEvents v1.0 envelope in JSON structured mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// CloudEvents spec version, always `1.0`.
    pub specversion: String,

    /// Event identifier; the idempotency key end to end.
    pub id: String,

    /// Logical producer name.
    pub source: String,

    /// Event type name, e.g. `application.created`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Domain-level subject the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Producer-side creation time, RFC 3339.
    pub time: DateTime<Utc>,

    /// URI of the JSON schema the payload conforms to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,

    /// MIME type of `data`, always `application/json`.
    pub datacontenttype: String,

    /// Opaque JSON payload.
    pub data: serde_json::Value,
}

impl CloudEvent {
    /// Serializes the envelope to its wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Encode` if the payload cannot be serialized;
    /// the caller treats this as terminal.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Encode` on malformed JSON or a missing
    /// required attribute.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
