//! In-memory store for tests and development.
//!
//! Mirrors the Postgres backend's observable behaviour: write transactions are
//! serialised (one async mutex guards the whole store), positions come from a
//! counter that is never rewound on rollback, and violations carry
//! Postgres-shaped detail strings so constraint attribution works unchanged.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use eventvault_core::{Event, SearchQuery, StreamKey};

use super::{
    ConstraintDelete, ConstraintKey, InsertedEvent, NewEvent, Store, StoreError, StoreTx,
    StreamHead,
};

const EVENTS_PKEY: &str = "events_pkey";
const UNIQUE_CONSTRAINTS_PKEY: &str = "unique_constraints_pkey";

#[derive(Debug, Default)]
struct State {
    events: Vec<Event>,
    heads: HashMap<StreamKey, StreamHead>,
    constraints: BTreeSet<ConstraintKey>,
    last_position: u64,
}

/// Process-local event log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed events.
    pub async fn len(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a unique-constraint row is currently committed.
    pub async fn has_constraint(&self, key: &ConstraintKey) -> bool {
        self.state.lock().await.constraints.contains(key)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(InMemoryTx {
            state: guard,
            events: Vec::new(),
            heads: HashMap::new(),
            deletes: Vec::new(),
            adds: BTreeSet::new(),
        })
    }

    async fn query_events(&self, query: &SearchQuery) -> Result<Vec<Event>, StoreError> {
        let state = self.state.lock().await;
        Ok(query.apply(state.events.iter().filter(|e| query.matches(e)).cloned()))
    }
}

/// Open transaction over an [`InMemoryStore`]. Holds the store lock until it ends.
#[derive(Debug)]
pub struct InMemoryTx {
    state: OwnedMutexGuard<State>,
    events: Vec<Event>,
    heads: HashMap<StreamKey, StreamHead>,
    deletes: Vec<ConstraintDelete>,
    adds: BTreeSet<ConstraintKey>,
}

impl InMemoryTx {
    fn head(&self, key: &StreamKey) -> Option<&StreamHead> {
        self.heads.get(key).or_else(|| self.state.heads.get(key))
    }

    fn constraint_exists(&self, key: &ConstraintKey) -> bool {
        if self.adds.contains(key) {
            return true;
        }
        self.state.constraints.contains(key) && !self.deletes.iter().any(|d| d.covers(key))
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn lock_stream_head(&mut self, key: &StreamKey) -> Result<Option<StreamHead>, StoreError> {
        Ok(self.head(key).cloned())
    }

    async fn insert_events(&mut self, events: &[NewEvent]) -> Result<Vec<InsertedEvent>, StoreError> {
        let mut claimed = HashSet::new();
        for event in events {
            let key = event.stream_key();
            let taken = self.head(&key).is_some_and(|h| event.sequence() <= h.sequence);
            if taken || !claimed.insert((key.clone(), event.sequence())) {
                return Err(StoreError::StreamConflict(format!(
                    "duplicate key value violates unique constraint \"{EVENTS_PKEY}\": {key} sequence {}",
                    event.sequence()
                )));
            }
        }

        let created_at = Utc::now();
        let mut inserted = Vec::with_capacity(events.len());
        for event in events {
            self.state.last_position += 1;
            let position = self.state.last_position;
            let key = event.stream_key();

            let head = StreamHead {
                sequence: event.sequence(),
                resource_owner: event.aggregate.resource_owner.clone(),
            };
            match self.heads.get_mut(&key) {
                Some(existing) if existing.sequence >= head.sequence => {}
                Some(existing) => *existing = head,
                None => {
                    self.heads.insert(key.clone(), head);
                }
            }

            inserted.push(InsertedEvent {
                stream: key,
                sequence: event.sequence(),
                global_position: position,
                created_at,
            });
            self.events.push(event.clone().into_event(position, created_at));
        }
        Ok(inserted)
    }

    async fn delete_unique_constraints(&mut self, deletes: &[ConstraintDelete]) -> Result<(), StoreError> {
        for delete in deletes {
            self.adds.retain(|key| !delete.covers(key));
            self.deletes.push(delete.clone());
        }
        Ok(())
    }

    async fn insert_unique_constraints(&mut self, keys: &[ConstraintKey]) -> Result<(), StoreError> {
        let mut batch = BTreeSet::new();
        for key in keys {
            if self.constraint_exists(key) || !batch.insert(key.clone()) {
                return Err(StoreError::UniqueViolation {
                    constraint: Some(UNIQUE_CONSTRAINTS_PKEY.to_string()),
                    detail: format!(
                        "Key (tenant_id, unique_type, unique_value)={} already exists.",
                        key.detail_fragment()
                    ),
                });
            }
        }
        self.adds.extend(batch);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let state = &mut *self.state;

        for delete in &self.deletes {
            state.constraints.retain(|key| !delete.covers(key));
        }
        state.constraints.append(&mut self.adds);

        for (key, head) in self.heads.drain() {
            state.heads.insert(key, head);
        }
        state.events.append(&mut self.events);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
