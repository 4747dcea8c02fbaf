//! Folding ordered events into aggregate state.
//!
//! A [`Reducer`] buffers events with `append_events` and folds them with `reduce`.
//! The buffer is drained by every successful `reduce`, so a model can be fed page
//! after page of history and only ever processes each event once.
//!
//! Models embed [`ReadModel`] or [`WriteModel`] and delegate to them after
//! applying their own domain state:
//!
//! ```ignore
//! impl Reducer<UserEvent> for UserView {
//!     fn append_events(&mut self, events: Vec<MappedEvent<UserEvent>>) {
//!         self.base.append_events(events);
//!     }
//!
//!     fn reduce(&mut self) -> Result<(), EventStoreError> {
//!         for e in &self.base.events {
//!             if let Some(UserEvent::Renamed(r)) = &e.decoded {
//!                 self.name = r.name.clone();
//!             }
//!         }
//!         self.base.reduce()
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};

use eventvault_core::{
    Aggregate, AggregateId, EventStoreError, SearchQuery, SearchQueryBuilder, TenantId,
};

use crate::mapper::MappedEvent;

/// Accumulates mapped events and folds them into state.
pub trait Reducer<D> {
    /// Buffer events, in query order.
    fn append_events(&mut self, events: Vec<MappedEvent<D>>);

    /// Fold the buffered events and clear the buffer. An empty buffer is a no-op.
    fn reduce(&mut self) -> Result<(), EventStoreError>;
}

impl<D, R> Reducer<D> for Box<R>
where
    R: Reducer<D> + ?Sized,
{
    fn append_events(&mut self, events: Vec<MappedEvent<D>>) {
        (**self).append_events(events)
    }

    fn reduce(&mut self) -> Result<(), EventStoreError> {
        (**self).reduce()
    }
}

/// Generic read-side state of one aggregate.
///
/// Identity fields and `created_at` come from the first event ever folded and are
/// never overwritten; `sequence`, `position` and `updated_at` track the last one.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadModel<D> {
    pub tenant_id: Option<TenantId>,
    pub aggregate_id: Option<AggregateId>,
    pub resource_owner: Option<String>,
    pub sequence: u64,
    pub position: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub events: Vec<MappedEvent<D>>,
}

impl<D> Default for ReadModel<D> {
    fn default() -> Self {
        Self {
            tenant_id: None,
            aggregate_id: None,
            resource_owner: None,
            sequence: 0,
            position: 0,
            created_at: None,
            updated_at: None,
            events: Vec::new(),
        }
    }
}

impl<D> ReadModel<D> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D> Reducer<D> for ReadModel<D> {
    fn append_events(&mut self, events: Vec<MappedEvent<D>>) {
        self.events.extend(events);
    }

    fn reduce(&mut self) -> Result<(), EventStoreError> {
        let (Some(first), Some(last)) = (self.events.first(), self.events.last()) else {
            return Ok(());
        };
        let first = &first.event;
        let last = &last.event;

        self.tenant_id
            .get_or_insert_with(|| first.aggregate.tenant_id.clone());
        self.aggregate_id
            .get_or_insert_with(|| first.aggregate.id.clone());
        self.resource_owner
            .get_or_insert_with(|| first.aggregate.resource_owner.clone());
        self.created_at.get_or_insert(first.created_at);

        self.sequence = last.aggregate.sequence;
        self.position = last.global_position;
        self.updated_at = Some(last.created_at);

        self.events.clear();
        Ok(())
    }
}

/// Write-side state of one aggregate: everything a command handler needs to
/// decide and then build the next [`eventvault_core::Command`].
///
/// `aggregate` is the stream reference as of the last folded event (sequence
/// included), ready to be reused for the next command.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteModel<D> {
    pub tenant_id: Option<TenantId>,
    pub aggregate_id: Option<AggregateId>,
    pub resource_owner: Option<String>,
    pub processed_sequence: u64,
    pub position: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub aggregate: Option<Aggregate>,
    pub events: Vec<MappedEvent<D>>,
}

impl<D> Default for WriteModel<D> {
    fn default() -> Self {
        Self {
            tenant_id: None,
            aggregate_id: None,
            resource_owner: None,
            processed_sequence: 0,
            position: 0,
            created_at: None,
            updated_at: None,
            aggregate: None,
            events: Vec::new(),
        }
    }
}

impl<D> WriteModel<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any event has been folded yet.
    pub fn exists(&self) -> bool {
        self.aggregate.is_some()
    }

    /// Query for the events of this aggregate not folded yet.
    ///
    /// Returns `None` until the first event has been folded; build the initial
    /// query with [`SearchQuery::for_stream`].
    pub fn next_query(&self) -> Option<Result<SearchQuery, EventStoreError>> {
        let aggregate = self.aggregate.as_ref()?;
        Some(
            SearchQueryBuilder::new()
                .tenant_ids([aggregate.tenant_id.clone()])
                .sequence_at_least(self.processed_sequence + 1)
                .add_query()
                .aggregate_types([aggregate.aggregate_type.clone()])
                .aggregate_ids([aggregate.id.clone()])
                .build()
                .build(),
        )
    }
}

impl<D> Reducer<D> for WriteModel<D> {
    fn append_events(&mut self, events: Vec<MappedEvent<D>>) {
        self.events.extend(events);
    }

    fn reduce(&mut self) -> Result<(), EventStoreError> {
        let (Some(first), Some(last)) = (self.events.first(), self.events.last()) else {
            return Ok(());
        };
        let first = &first.event;
        let last = &last.event;

        self.tenant_id
            .get_or_insert_with(|| first.aggregate.tenant_id.clone());
        self.aggregate_id
            .get_or_insert_with(|| first.aggregate.id.clone());
        self.resource_owner
            .get_or_insert_with(|| first.aggregate.resource_owner.clone());
        self.created_at.get_or_insert(first.created_at);

        self.processed_sequence = last.aggregate.sequence;
        self.position = last.global_position;
        self.updated_at = Some(last.created_at);
        self.aggregate = Some(last.aggregate.clone());

        self.events.clear();
        Ok(())
    }
}
