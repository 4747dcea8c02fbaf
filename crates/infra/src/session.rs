//! Sessions: collect commands, then push them as one batch.

use std::collections::BTreeSet;

use eventvault_core::{Command, EventStoreError, SearchQuery, StreamKey};
use eventvault_events::{MappedEvent, Reducer};

use crate::event_store::EventStore;
use crate::store::Store;

/// A unit of work over an [`EventStore`].
///
/// Nothing touches the store until [`save_changes`](Self::save_changes); no
/// transaction is open while commands are collected.
#[derive(Debug)]
pub struct Session<'a, S, D> {
    store: &'a EventStore<S, D>,
    commands: Vec<Command>,
    new_streams: BTreeSet<StreamKey>,
}

impl<'a, S, D> Session<'a, S, D>
where
    S: Store,
    D: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(store: &'a EventStore<S, D>) -> Self {
        Self {
            store,
            commands: Vec::new(),
            new_streams: BTreeSet::new(),
        }
    }

    /// Append commands that create their streams. Saving fails with
    /// `AlreadyExists` if any of those streams already has events.
    pub fn start_stream(&mut self, commands: impl IntoIterator<Item = Command>) -> &mut Self {
        for command in commands {
            self.new_streams.insert(command.aggregate.stream_key());
            self.commands.push(command);
        }
        self
    }

    pub fn append(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn append_all(&mut self, commands: impl IntoIterator<Item = Command>) -> &mut Self {
        self.commands.extend(commands);
        self
    }

    pub fn pending(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Push everything collected so far as one all-or-nothing batch.
    ///
    /// The session is drained either way; on error nothing was stored.
    pub async fn save_changes(&mut self) -> Result<Vec<MappedEvent<D>>, EventStoreError> {
        let commands = std::mem::take(&mut self.commands);
        let new_streams = std::mem::take(&mut self.new_streams);
        self.store.push_batch(commands, new_streams).await
    }

    pub async fn reduce<R>(&self, query: &SearchQuery, reducer: &mut R) -> Result<(), EventStoreError>
    where
        R: Reducer<D> + ?Sized,
    {
        self.store.reduce(query, reducer).await
    }
}
