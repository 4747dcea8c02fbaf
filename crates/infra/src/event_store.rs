//! The event store engine: atomic batch pushes with bounded retry, filtered
//! reads and reductions.
//!
//! A push runs in one store transaction:
//!
//! 1. lock the head of every stream the batch touches and claim consecutive
//!    sequences,
//! 2. insert the events,
//! 3. apply unique constraint deletes, then adds,
//! 4. map the stored events through the registry,
//! 5. commit.
//!
//! A sequence race (two writers claiming the same sequence on a fresh stream)
//! or a serialization failure rolls the transaction back and the whole batch is
//! retried under [`RetryPolicy`](crate::retry::RetryPolicy). Anything else is
//! terminal. Subscribers are notified only after a successful commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn, Span};

use eventvault_core::{Command, EventStoreError, SearchQuery, StreamKey};
use eventvault_events::{EventMapperRegistry, MappedEvent, Notifier, Reducer};

use crate::config::EventStoreConfig;
use crate::push::{attach_positions, ensure_new_streams, materialize, rollback, AttemptError};
use crate::sequence::resolve_sequences;
use crate::session::Session;
use crate::store::{Store, StoreTx};
use crate::unique_constraint::ConstraintPlan;

/// Event store over a [`Store`] backend, decoding payloads into `D`.
pub struct EventStore<S, D> {
    store: S,
    mappers: Arc<EventMapperRegistry<D>>,
    notifier: Arc<Notifier<D>>,
    config: EventStoreConfig,
}

impl<S, D> std::fmt::Debug for EventStore<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("mappers", &self.mappers)
            .field("notifier", &self.notifier)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, D> EventStore<S, D>
where
    S: Store,
    D: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        mappers: Arc<EventMapperRegistry<D>>,
        notifier: Arc<Notifier<D>>,
        config: EventStoreConfig,
    ) -> Self {
        Self {
            store,
            mappers,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn mappers(&self) -> &Arc<EventMapperRegistry<D>> {
        &self.mappers
    }

    pub fn notifier(&self) -> &Arc<Notifier<D>> {
        &self.notifier
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    /// Start collecting commands to push as one batch.
    pub fn session(&self) -> Session<'_, S, D> {
        Session::new(self)
    }

    /// Append `commands` atomically and return the stored events in input order.
    ///
    /// Either every event is stored and every unique constraint change applied,
    /// or nothing is.
    #[instrument(skip(self, commands), fields(commands = commands.len()), err)]
    pub async fn push(&self, commands: Vec<Command>) -> Result<Vec<MappedEvent<D>>, EventStoreError> {
        self.push_batch(commands, BTreeSet::new()).await
    }

    /// Like [`push`](Self::push), but every stream in `new_streams` must have no
    /// events yet.
    pub(crate) async fn push_batch(
        &self,
        commands: Vec<Command>,
        new_streams: BTreeSet<StreamKey>,
    ) -> Result<Vec<MappedEvent<D>>, EventStoreError> {
        if commands.is_empty() {
            return Err(EventStoreError::validation("push requires at least one command"));
        }
        for command in &commands {
            command.validate()?;
        }

        let timeout = self.config.push_timeout;
        let events = tokio::time::timeout(timeout, self.push_with_retry(&commands, &new_streams))
            .await
            .map_err(|_| {
                warn!(?timeout, "push timed out");
                EventStoreError::Timeout(timeout)
            })??;

        self.notifier.notify(&events);
        info!(events = events.len(), "events pushed");
        Ok(events)
    }

    async fn push_with_retry(
        &self,
        commands: &[Command],
        new_streams: &BTreeSet<StreamKey>,
    ) -> Result<Vec<MappedEvent<D>>, EventStoreError> {
        let policy = &self.config.retry;
        let mut retries = 0;

        loop {
            match self.try_push(commands, new_streams).await {
                Ok(events) => return Ok(events),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Retryable(err)) if policy.should_retry(retries) => {
                    retries += 1;
                    let delay = policy.delay_for_retry(retries);
                    debug!(error = %err, retry = retries, ?delay, "push raced, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Retryable(err)) => {
                    warn!(error = %err, retries, "push retries exhausted");
                    return Err(EventStoreError::conflict(format!(
                        "gave up after {retries} retries: {err}"
                    )));
                }
            }
        }
    }

    async fn try_push(
        &self,
        commands: &[Command],
        new_streams: &BTreeSet<StreamKey>,
    ) -> Result<Vec<MappedEvent<D>>, AttemptError> {
        let mut tx = self.store.begin().await?;

        match self.write_batch(&mut tx, commands, new_streams).await {
            Ok(events) => {
                tx.commit().await?;
                Ok(events)
            }
            Err(err) => Err(rollback(tx, err).await),
        }
    }

    async fn write_batch(
        &self,
        tx: &mut S::Tx,
        commands: &[Command],
        new_streams: &BTreeSet<StreamKey>,
    ) -> Result<Vec<MappedEvent<D>>, AttemptError> {
        let streams = resolve_sequences(tx, commands).await?;
        ensure_new_streams(&streams, new_streams)?;

        let new_events = materialize(commands, streams)?;
        let inserted = tx.insert_events(&new_events).await?;

        ConstraintPlan::from_commands(commands).enforce(tx).await?;

        let events = attach_positions(new_events, inserted)?;
        Ok(self.mappers.map_all(events)?)
    }

    /// Events matching `query`, mapped, in query order.
    #[instrument(skip(self, query), fields(events = tracing::field::Empty), err)]
    pub async fn filter(&self, query: &SearchQuery) -> Result<Vec<MappedEvent<D>>, EventStoreError> {
        let events = self.store.query_events(query).await?;
        Span::current().record("events", events.len());
        self.mappers.map_all(events)
    }

    /// Feed the events matching `query` into `reducer` and fold them.
    #[instrument(skip(self, query, reducer), err)]
    pub async fn reduce<R>(&self, query: &SearchQuery, reducer: &mut R) -> Result<(), EventStoreError>
    where
        R: Reducer<D> + ?Sized,
    {
        let events = self.filter(query).await?;
        reducer.append_events(events);
        reducer.reduce()
    }
}
