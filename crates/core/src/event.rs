//! Persisted events.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::id::EventType;

/// An immutable, persisted fact in an aggregate stream.
///
/// `aggregate.sequence` is the per-stream sequence the event received (1-based,
/// gap-free). `global_position` is assigned by the store, increases strictly across
/// the whole log and may have gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub aggregate: Aggregate,
    pub event_type: EventType,

    /// JSON-encoded payload; `None` when the command carried no payload.
    pub payload: Option<Vec<u8>>,

    pub creator: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,

    pub global_position: u64,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn sequence(&self) -> u64 {
        self.aggregate.sequence
    }

    /// Decode the payload bytes into `T`; `Ok(None)` when there is no payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
    }

    /// The payload parsed as a generic JSON value.
    pub fn payload_json(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        self.payload_as()
    }
}
