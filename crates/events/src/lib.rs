//! Process-local machinery over the event model.
//!
//! - [`EventMapperRegistry`]: upgrades raw events into typed payloads per
//!   `(aggregate type, event type)` pair.
//! - [`Notifier`]: best-effort fan-out of committed events to in-memory subscribers.
//! - [`Reducer`], [`ReadModel`], [`WriteModel`]: fold ordered events into aggregate state.
//!
//! Everything here is constructor-injected; there is no process-global state.

pub mod mapper;
pub mod notifier;
pub mod reducer;

pub use mapper::{EventMapperRegistry, MappedEvent};
pub use notifier::{Interest, Notifier, SubscriptionHandle};
pub use reducer::{ReadModel, Reducer, WriteModel};

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;
    use eventvault_core::{Aggregate, AggregateVersion, Event};
    use uuid::Uuid;

    pub fn event(agg_type: &str, id: &str, event_type: &str, seq: u64, payload: Option<&str>) -> Event {
        let mut aggregate = Aggregate::new("t1", agg_type, AggregateVersion::default(), id, "org1");
        aggregate.sequence = seq;
        Event {
            id: Uuid::now_v7(),
            aggregate,
            event_type: event_type.into(),
            payload: payload.map(|p| p.as_bytes().to_vec()),
            creator: None,
            correlation_id: None,
            causation_id: None,
            global_position: seq,
            created_at: Utc::now(),
        }
    }
}
