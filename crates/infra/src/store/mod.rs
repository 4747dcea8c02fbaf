//! Store boundary.
//!
//! The engine needs very little from a backend: a transaction with row-locking
//! stream-head lookups, a batched event insert that reports server-assigned
//! positions, and insert/delete on the unique-constraint table. Backends classify
//! their failures into [`StoreError`] so the engine can decide what to retry.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use eventvault_core::{
    Aggregate, BoxError, Event, EventStoreError, EventType, SearchQuery, StreamKey, TenantId,
    UniqueType,
};

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Failure classification at the store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer claimed the same `(tenant, type, id, sequence)`.
    #[error("stream conflict: {0}")]
    StreamConflict(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// A unique index other than the events key was violated. `detail` carries the
    /// offending key values as reported by the store.
    #[error("unique violation ({}): {detail}", .constraint.as_deref().unwrap_or("unknown constraint"))]
    UniqueViolation {
        constraint: Option<String>,
        detail: String,
    },

    #[error("database error in {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("failed to decode {0}")]
    Decode(String),
}

impl StoreError {
    /// Only a sequence race or a serialization failure can succeed on a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StreamConflict(_) | Self::SerializationFailure(_))
    }

    pub fn database<E>(operation: &'static str, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Database {
            operation,
            source: source.into(),
        }
    }
}

impl From<StoreError> for EventStoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StreamConflict(msg) | StoreError::SerializationFailure(msg) => {
                EventStoreError::conflict(msg)
            }
            other => EventStoreError::internal_with("store operation failed", other),
        }
    }
}

/// Highest stored sequence of a stream and the owner recorded on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHead {
    pub sequence: u64,
    pub resource_owner: String,
}

/// A materialised event awaiting insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub id: Uuid,
    /// Carries the sequence this event claims.
    pub aggregate: Aggregate,
    pub event_type: EventType,
    pub payload: Option<Vec<u8>>,
    pub creator: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

impl NewEvent {
    pub fn stream_key(&self) -> StreamKey {
        self.aggregate.stream_key()
    }

    pub fn sequence(&self) -> u64 {
        self.aggregate.sequence
    }

    /// Complete the event with the columns the store assigned.
    pub fn into_event(self, global_position: u64, created_at: DateTime<Utc>) -> Event {
        Event {
            id: self.id,
            aggregate: self.aggregate,
            event_type: self.event_type,
            payload: self.payload,
            creator: self.creator,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            global_position,
            created_at,
        }
    }
}

/// Server-assigned columns of one inserted row, identified by stream and sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedEvent {
    pub stream: StreamKey,
    pub sequence: u64,
    pub global_position: u64,
    pub created_at: DateTime<Utc>,
}

/// Primary key of a unique-constraint row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstraintKey {
    pub tenant_id: TenantId,
    pub unique_type: UniqueType,
    pub unique_value: String,
}

impl ConstraintKey {
    /// The `(tenant, type, value)` fragment a store reports in its violation detail.
    pub fn detail_fragment(&self) -> String {
        format!("({}, {}, {})", self.tenant_id, self.unique_type, self.unique_value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintDelete {
    /// Remove exactly one row.
    Key(ConstraintKey),
    /// Remove every row of the tenant scope.
    Tenant(TenantId),
}

impl ConstraintDelete {
    pub fn covers(&self, key: &ConstraintKey) -> bool {
        match self {
            Self::Key(k) => k == key,
            Self::Tenant(tenant) => &key.tenant_id == tenant,
        }
    }
}

/// A transactional event log backend.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Open a read-committed transaction.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Run a search outside any write transaction.
    async fn query_events(&self, query: &SearchQuery) -> Result<Vec<Event>, StoreError>;
}

/// An open write transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// Highest sequence and owner of the stream, locking it until the transaction ends.
    async fn lock_stream_head(&mut self, key: &StreamKey) -> Result<Option<StreamHead>, StoreError>;

    async fn insert_events(&mut self, events: &[NewEvent]) -> Result<Vec<InsertedEvent>, StoreError>;

    async fn delete_unique_constraints(&mut self, deletes: &[ConstraintDelete]) -> Result<(), StoreError>;

    async fn insert_unique_constraints(&mut self, keys: &[ConstraintKey]) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> Store for Arc<S>
where
    S: Store,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }

    async fn query_events(&self, query: &SearchQuery) -> Result<Vec<Event>, StoreError> {
        (**self).query_events(query).await
    }
}
