//! In-memory subscription notifier.
//!
//! Subscribers register a caller-sized `tokio::sync::mpsc` sender together with an
//! [`Interest`]. After every successful push the engine hands the committed,
//! mapped events to [`Notifier::notify`], which offers each event to the matching
//! subscribers without ever blocking:
//!
//! - full channel: the event is dropped for that subscriber and a warning is logged
//! - closed channel (receiver dropped): the subscriber is pruned
//!
//! Subscriptions are not persisted; they are lost on restart.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use eventvault_core::{AggregateType, EventType};

use crate::mapper::MappedEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventFilter {
    All,
    Only(Vec<EventType>),
}

impl EventFilter {
    fn accepts(&self, event_type: &EventType) -> bool {
        match self {
            Self::All => true,
            Self::Only(types) => types.contains(event_type),
        }
    }
}

/// Which aggregate types (and optionally which of their event types) a subscriber wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interest {
    by_type: BTreeMap<AggregateType, EventFilter>,
}

impl Interest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event type of `aggregate_type`.
    pub fn aggregate(mut self, aggregate_type: impl Into<AggregateType>) -> Self {
        self.by_type.insert(aggregate_type.into(), EventFilter::All);
        self
    }

    /// Only the listed event types of `aggregate_type`. An empty list means all of them.
    pub fn events<I, T>(mut self, aggregate_type: impl Into<AggregateType>, event_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        let aggregate_type = aggregate_type.into();
        let listed: Vec<EventType> = event_types.into_iter().map(Into::into).collect();

        let filter = match (self.by_type.remove(&aggregate_type), listed.is_empty()) {
            (Some(EventFilter::All), _) | (_, true) => EventFilter::All,
            (Some(EventFilter::Only(mut types)), false) => {
                types.extend(listed);
                EventFilter::Only(types)
            }
            (None, false) => EventFilter::Only(listed),
        };
        self.by_type.insert(aggregate_type, filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn aggregate_types(&self) -> impl Iterator<Item = &AggregateType> {
        self.by_type.keys()
    }

    /// Whether an event of this aggregate/event type matches.
    pub fn matches(&self, aggregate_type: &AggregateType, event_type: &EventType) -> bool {
        self.by_type
            .get(aggregate_type)
            .is_some_and(|filter| filter.accepts(event_type))
    }
}

struct Subscriber<D> {
    id: u64,
    filter: EventFilter,
    sender: mpsc::Sender<MappedEvent<D>>,
}

type Buckets<D> = HashMap<AggregateType, Vec<Subscriber<D>>>;

/// Fan-out of committed events to in-memory subscribers.
pub struct Notifier<D> {
    buckets: Arc<Mutex<Buckets<D>>>,
    next_id: AtomicU64,
}

impl<D> Default for Notifier<D> {
    fn default() -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<D> std::fmt::Debug for Notifier<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl<D> Notifier<D>
where
    D: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sender` under every aggregate type named in `interest`.
    ///
    /// The notifier only ever uses `try_send`; size the channel for the expected burst.
    pub fn subscribe(&self, sender: mpsc::Sender<MappedEvent<D>>, interest: Interest) -> SubscriptionHandle<D> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let aggregate_types: Vec<AggregateType> = interest.by_type.keys().cloned().collect();

        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        for (aggregate_type, filter) in interest.by_type {
            buckets.entry(aggregate_type).or_default().push(Subscriber {
                id,
                filter,
                sender: sender.clone(),
            });
        }
        debug!(subscription_id = id, ?aggregate_types, "subscription registered");

        SubscriptionHandle {
            id,
            aggregate_types,
            buckets: Arc::downgrade(&self.buckets),
            active: AtomicBool::new(true),
        }
    }

    /// Subscribe to every event of the given aggregate types.
    pub fn subscribe_aggregates<I, T>(
        &self,
        sender: mpsc::Sender<MappedEvent<D>>,
        aggregate_types: I,
    ) -> SubscriptionHandle<D>
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        let interest = aggregate_types
            .into_iter()
            .fold(Interest::new(), |interest, t| interest.aggregate(t));
        self.subscribe(sender, interest)
    }

    /// Offer every event to the matching subscribers. Never blocks, never fails.
    pub fn notify(&self, events: &[MappedEvent<D>]) {
        if events.is_empty() {
            return;
        }

        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            let Some(subscribers) = buckets.get_mut(event.aggregate_type()) else {
                continue;
            };

            subscribers.retain(|sub| {
                if !sub.filter.accepts(event.event_type()) {
                    return true;
                }
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            subscription_id = sub.id,
                            aggregate_type = %event.aggregate_type(),
                            event_type = %event.event_type(),
                            sequence = event.event.aggregate.sequence,
                            "subscriber channel full, event dropped"
                        );
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(subscription_id = sub.id, "subscriber channel closed, removing");
                        false
                    }
                }
            });
        }
        buckets.retain(|_, subscribers| !subscribers.is_empty());
    }
}

impl<D> Notifier<D> {
    /// Number of live subscriptions (a subscription spanning several aggregate types counts once).
    pub fn subscription_count(&self) -> usize {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .values()
            .flatten()
            .map(|sub| sub.id)
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Handle returned by [`Notifier::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`SubscriptionHandle::unsubscribe`].
/// Once unsubscribed, the notifier holds no sender clones, so the receiver
/// sees the channel closed after the caller drops its own senders.
pub struct SubscriptionHandle<D> {
    id: u64,
    aggregate_types: Vec<AggregateType>,
    buckets: Weak<Mutex<Buckets<D>>>,
    active: AtomicBool,
}

impl<D> std::fmt::Debug for SubscriptionHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("aggregate_types", &self.aggregate_types)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<D> SubscriptionHandle<D> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove this subscription from every bucket it was registered under. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(buckets) = self.buckets.upgrade() else {
            return;
        };

        let mut buckets = buckets.lock().unwrap_or_else(PoisonError::into_inner);
        for aggregate_type in &self.aggregate_types {
            if let Some(subscribers) = buckets.get_mut(aggregate_type) {
                subscribers.retain(|sub| sub.id != self.id);
                if subscribers.is_empty() {
                    buckets.remove(aggregate_type);
                }
            }
        }
        debug!(subscription_id = self.id, "subscription removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::event;

    fn mapped(agg_type: &str, event_type: &str, seq: u64) -> MappedEvent<()> {
        MappedEvent::raw(event(agg_type, "a1", event_type, seq, None))
    }

    #[tokio::test]
    async fn aggregate_interest_receives_every_event_type_once() {
        let notifier = Notifier::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _handle = notifier.subscribe_aggregates(tx, ["user"]);

        notifier.notify(&[mapped("user", "user.created", 1), mapped("org", "org.added", 1)]);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type().as_str(), "user.created");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn event_type_interest_filters() {
        let notifier = Notifier::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _handle = notifier.subscribe(tx, Interest::new().events("user", ["user.removed"]));

        notifier.notify(&[mapped("user", "user.created", 1), mapped("user", "user.removed", 2)]);

        assert_eq!(rx.recv().await.unwrap().event.aggregate.sequence, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let notifier = Notifier::new();
        let (tx, mut rx) = mpsc::channel(1);
        let _handle = notifier.subscribe_aggregates(tx, ["user"]);

        notifier.notify(&[mapped("user", "e", 1), mapped("user", "e", 2), mapped("user", "e", 3)]);

        assert_eq!(rx.try_recv().unwrap().event.aggregate.sequence, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(notifier.subscription_count(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_closes_channel() {
        let notifier = Notifier::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = notifier.subscribe(tx, Interest::new().aggregate("user").aggregate("org"));
        assert_eq!(notifier.subscription_count(), 1);

        handle.unsubscribe();
        handle.unsubscribe();
        assert!(!handle.is_active());
        assert_eq!(notifier.subscription_count(), 0);

        notifier.notify(&[mapped("user", "e", 1)]);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let notifier = Notifier::new();
        let (tx, rx) = mpsc::channel(4);
        let _handle = notifier.subscribe_aggregates(tx, ["user"]);
        drop(rx);

        notifier.notify(&[mapped("user", "e", 1)]);
        assert_eq!(notifier.subscription_count(), 0);
    }

    #[test]
    fn unsubscribe_after_notifier_dropped_is_harmless() {
        let notifier = Notifier::<()>::new();
        let (tx, _rx) = mpsc::channel(1);
        let handle = notifier.subscribe_aggregates(tx, ["user"]);
        drop(notifier);
        handle.unsubscribe();
    }

    #[test]
    fn interest_merges_event_lists() {
        let interest = Interest::new()
            .events("user", ["a"])
            .events("user", ["b"])
            .events("org", Vec::<EventType>::new());

        assert!(interest.matches(&"user".into(), &"a".into()));
        assert!(interest.matches(&"user".into(), &"b".into()));
        assert!(!interest.matches(&"user".into(), &"c".into()));
        assert!(interest.matches(&"org".into(), &"anything".into()));

        let widened = interest.aggregate("user");
        assert!(widened.matches(&"user".into(), &"c".into()));
    }
}
