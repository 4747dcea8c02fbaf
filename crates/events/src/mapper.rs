//! Event mapper registry.
//!
//! Raw events carry an opaque JSON payload. Collaborators register one mapper per
//! `(aggregate type, event type)` pair at startup; mapping then turns a raw
//! [`Event`] into a [`MappedEvent`] whose `decoded` value is the caller's own sum
//! type `D`. Pairs without a mapper pass through with `decoded: None`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use serde::de::DeserializeOwned;
use tracing::debug;

use eventvault_core::{AggregateType, Event, EventStoreError, EventType};

type MapperFn<D> = Arc<dyn Fn(&Event) -> anyhow::Result<D> + Send + Sync>;

/// A persisted event plus its decoded payload, if a mapper is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedEvent<D> {
    pub event: Event,
    pub decoded: Option<D>,
}

impl<D> MappedEvent<D> {
    /// Wrap an event no mapper is registered for.
    pub fn raw(event: Event) -> Self {
        Self { event, decoded: None }
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.event.aggregate.aggregate_type
    }

    pub fn event_type(&self) -> &EventType {
        &self.event.event_type
    }
}

/// Registry of payload mappers keyed by aggregate type, then event type.
///
/// Populate it before the store takes traffic; reads after that only take a
/// shared lock for the lookup, never while a mapper runs.
pub struct EventMapperRegistry<D> {
    mappers: RwLock<HashMap<AggregateType, HashMap<EventType, MapperFn<D>>>>,
}

impl<D> Default for EventMapperRegistry<D> {
    fn default() -> Self {
        Self {
            mappers: RwLock::new(HashMap::new()),
        }
    }
}

impl<D> fmt::Debug for EventMapperRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMapperRegistry")
            .field("aggregate_types", &self.aggregate_types())
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl<D> EventMapperRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mapper` for the pair, replacing any previous one.
    pub fn register<F>(
        &self,
        aggregate_type: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        mapper: F,
    ) where
        F: Fn(&Event) -> anyhow::Result<D> + Send + Sync + 'static,
    {
        let aggregate_type = aggregate_type.into();
        let event_type = event_type.into();
        debug!(%aggregate_type, %event_type, "registering event mapper");

        let mut mappers = self.mappers.write().unwrap_or_else(PoisonError::into_inner);
        mappers
            .entry(aggregate_type)
            .or_default()
            .insert(event_type, Arc::new(mapper));
    }

    /// Register a mapper that decodes the JSON payload into `T` and wraps it into `D`.
    pub fn register_json<T, W>(
        &self,
        aggregate_type: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        wrap: W,
    ) where
        T: DeserializeOwned,
        W: Fn(T) -> D + Send + Sync + 'static,
    {
        self.register(aggregate_type, event_type, move |event: &Event| {
            let payload = event
                .payload_as::<T>()
                .with_context(|| format!("decoding payload of {}", event.event_type))?
                .with_context(|| format!("{} has no payload", event.event_type))?;
            Ok(wrap(payload))
        });
    }

    fn lookup(&self, aggregate_type: &AggregateType, event_type: &EventType) -> Option<MapperFn<D>> {
        let mappers = self.mappers.read().unwrap_or_else(PoisonError::into_inner);
        mappers.get(aggregate_type)?.get(event_type).cloned()
    }

    pub fn is_registered(&self, aggregate_type: &AggregateType, event_type: &EventType) -> bool {
        self.lookup(aggregate_type, event_type).is_some()
    }

    /// Map one raw event. A failing mapper is an internal error.
    pub fn map(&self, event: Event) -> Result<MappedEvent<D>, EventStoreError> {
        let Some(mapper) = self.lookup(&event.aggregate.aggregate_type, &event.event_type) else {
            return Ok(MappedEvent::raw(event));
        };

        match mapper(&event) {
            Ok(decoded) => Ok(MappedEvent {
                event,
                decoded: Some(decoded),
            }),
            Err(err) => Err(EventStoreError::internal_with(
                format!(
                    "mapping {}/{} at sequence {} failed",
                    event.aggregate.aggregate_type,
                    event.event_type,
                    event.aggregate.sequence
                ),
                err,
            )),
        }
    }

    /// Map a batch; the first failure aborts the whole batch.
    pub fn map_all(&self, events: Vec<Event>) -> Result<Vec<MappedEvent<D>>, EventStoreError> {
        events.into_iter().map(|event| self.map(event)).collect()
    }

    /// Every registered event type, sorted and deduplicated.
    pub fn event_types(&self) -> Vec<EventType> {
        let mappers = self.mappers.read().unwrap_or_else(PoisonError::into_inner);
        mappers
            .values()
            .flat_map(|by_event| by_event.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every aggregate type with at least one mapper, sorted.
    pub fn aggregate_types(&self) -> Vec<AggregateType> {
        let mappers = self.mappers.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<AggregateType> = mappers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::testing::event;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct UserCreated {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum UserEvent {
        Created(UserCreated),
        Removed,
    }

    fn registry() -> EventMapperRegistry<UserEvent> {
        let registry = EventMapperRegistry::new();
        registry.register_json("user", "user.created", UserEvent::Created);
        registry.register("user", "user.removed", |_: &Event| Ok(UserEvent::Removed));
        registry
    }

    #[test]
    fn registered_pair_decodes_payload() {
        let mapped = registry()
            .map(event("user", "u1", "user.created", 1, Some(r#"{"name":"a"}"#)))
            .unwrap();

        assert_eq!(
            mapped.decoded,
            Some(UserEvent::Created(UserCreated { name: "a".to_string() }))
        );
        assert_eq!(mapped.event.aggregate.sequence, 1);
    }

    #[test]
    fn unregistered_pair_passes_through() {
        let raw = event("user", "u1", "user.renamed", 2, Some(r#"{"name":"b"}"#));
        let mapped = registry().map(raw.clone()).unwrap();
        assert_eq!(mapped, MappedEvent::raw(raw));
    }

    #[test]
    fn mapping_failure_aborts_the_batch() {
        let events = vec![
            event("user", "u1", "user.created", 1, Some(r#"{"name":"a"}"#)),
            event("user", "u1", "user.created", 2, Some(r#"{"nope":1}"#)),
        ];
        let err = registry().map_all(events).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("user/user.created"));
    }

    #[test]
    fn missing_payload_is_a_mapping_error() {
        let err = registry()
            .map(event("user", "u1", "user.created", 1, None))
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn listings_are_sorted() {
        let registry = registry();
        registry.register("org", "org.added", |_: &Event| Ok(UserEvent::Removed));

        assert_eq!(
            registry.aggregate_types(),
            vec![AggregateType::from("org"), AggregateType::from("user")]
        );
        assert_eq!(
            registry.event_types(),
            vec![
                EventType::from("org.added"),
                EventType::from("user.created"),
                EventType::from("user.removed"),
            ]
        );
    }
}
