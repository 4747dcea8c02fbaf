//! One push attempt: resolve sequences, materialise events, insert, enforce
//! unique constraints, map. The retry loop around it lives in `event_store`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use eventvault_core::{Command, Event, EventStoreError, StreamKey};

use crate::sequence::ResolvedStream;
use crate::store::{InsertedEvent, NewEvent, StoreError, StoreTx};
use crate::unique_constraint::EnforceError;

/// Failure of a single attempt.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Worth another attempt (sequence race, serialization failure).
    Retryable(StoreError),
    Fatal(EventStoreError),
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err)
        } else {
            Self::Fatal(err.into())
        }
    }
}

impl From<EventStoreError> for AttemptError {
    fn from(err: EventStoreError) -> Self {
        Self::Fatal(err)
    }
}

impl From<EnforceError> for AttemptError {
    fn from(err: EnforceError) -> Self {
        match err {
            EnforceError::Rejected(err) => Self::Fatal(err),
            EnforceError::Store(err) => err.into(),
        }
    }
}

/// Streams a batch must create; any of them already having events rejects the batch.
pub(crate) fn ensure_new_streams(
    streams: &BTreeMap<StreamKey, ResolvedStream>,
    new_streams: &BTreeSet<StreamKey>,
) -> Result<(), EventStoreError> {
    for key in new_streams {
        if streams.get(key).is_some_and(|s| s.existed) {
            return Err(EventStoreError::already_exists(format!("stream {key} already exists")));
        }
    }
    Ok(())
}

/// Turn commands into events, claiming consecutive sequences per stream in input order.
pub(crate) fn materialize(
    commands: &[Command],
    mut streams: BTreeMap<StreamKey, ResolvedStream>,
) -> Result<Vec<NewEvent>, EventStoreError> {
    commands
        .iter()
        .map(|command| {
            let key = command.aggregate.stream_key();
            let stream = streams
                .get_mut(&key)
                .ok_or_else(|| EventStoreError::internal(format!("no resolved sequence for stream {key}")))?;
            stream.sequence += 1;

            let mut aggregate = command.aggregate.clone();
            aggregate.sequence = stream.sequence;
            aggregate.resource_owner = stream.resource_owner.clone();

            let payload = command
                .payload
                .as_ref()
                .map(serde_json::to_vec)
                .transpose()
                .map_err(|e| EventStoreError::internal_with("failed to serialize payload", e))?;

            Ok(NewEvent {
                id: Uuid::now_v7(),
                aggregate,
                event_type: command.event_type.clone(),
                payload,
                creator: command.creator.clone(),
                correlation_id: command.correlation_id.clone(),
                causation_id: command.causation_id.clone(),
            })
        })
        .collect()
}

/// Attach server-assigned columns, keeping input order.
pub(crate) fn attach_positions(
    new_events: Vec<NewEvent>,
    inserted: Vec<InsertedEvent>,
) -> Result<Vec<Event>, EventStoreError> {
    let mut assigned: HashMap<(StreamKey, u64), (u64, DateTime<Utc>)> = inserted
        .into_iter()
        .map(|row| ((row.stream, row.sequence), (row.global_position, row.created_at)))
        .collect();

    new_events
        .into_iter()
        .map(|event| {
            let (position, created_at) = assigned
                .remove(&(event.stream_key(), event.sequence()))
                .ok_or_else(|| {
                    EventStoreError::internal(format!(
                        "store returned no position for {} sequence {}",
                        event.stream_key(),
                        event.sequence()
                    ))
                })?;
            Ok(event.into_event(position, created_at))
        })
        .collect()
}

/// Roll back after `err`; a failing rollback wraps the original error.
pub(crate) async fn rollback<T>(tx: T, err: AttemptError) -> AttemptError
where
    T: StoreTx,
{
    match tx.rollback().await {
        Ok(()) => err,
        Err(rollback_err) => {
            error!(error = %rollback_err, "rollback failed");
            let original = match err {
                AttemptError::Retryable(store_err) => store_err.into(),
                AttemptError::Fatal(err) => err,
            };
            AttemptError::Fatal(EventStoreError::RollbackFailed {
                source: Box::new(original),
                rollback: rollback_err.to_string(),
            })
        }
    }
}
