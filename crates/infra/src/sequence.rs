//! Sequence resolution for a push batch.

use std::collections::BTreeMap;

use tracing::trace;

use eventvault_core::{Command, StreamKey};

use crate::store::{StoreError, StoreTx};

/// Current state of one stream touched by a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStream {
    /// Highest sequence claimed so far (stored, then advanced in memory).
    pub sequence: u64,
    pub resource_owner: String,
    /// Whether the stream had events before this batch.
    pub existed: bool,
}

/// Lock and read the head of every distinct stream referenced by `commands`.
///
/// Streams are locked in key order so that two batches touching the same streams
/// cannot deadlock. A stream without events starts at sequence 0, owned by the
/// first command in the batch that references it.
pub async fn resolve_sequences<T>(
    tx: &mut T,
    commands: &[Command],
) -> Result<BTreeMap<StreamKey, ResolvedStream>, StoreError>
where
    T: StoreTx + ?Sized,
{
    let mut first_owner: BTreeMap<StreamKey, &str> = BTreeMap::new();
    for command in commands {
        first_owner
            .entry(command.aggregate.stream_key())
            .or_insert(command.aggregate.resource_owner.as_str());
    }

    let mut resolved = BTreeMap::new();
    for (key, owner) in first_owner {
        let stream = match tx.lock_stream_head(&key).await? {
            Some(head) => ResolvedStream {
                sequence: head.sequence,
                resource_owner: head.resource_owner,
                existed: true,
            },
            None => ResolvedStream {
                sequence: 0,
                resource_owner: owner.to_string(),
                existed: false,
            },
        };
        trace!(stream = %key, sequence = stream.sequence, "stream head resolved");
        resolved.insert(key, stream);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use eventvault_core::{Aggregate, AggregateVersion};

    use super::*;
    use crate::store::{InMemoryStore, Store};

    fn command(id: &str, owner: &str) -> Command {
        Command::new(
            Aggregate::new("t1", "user", AggregateVersion::default(), id, owner),
            "user.created",
        )
    }

    #[tokio::test]
    async fn new_streams_start_at_zero_with_first_owner() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let commands = vec![command("u1", "org1"), command("u1", "org2"), command("u2", "org3")];
        let resolved = resolve_sequences(&mut tx, &commands).await.unwrap();

        assert_eq!(resolved.len(), 2);
        let u1 = &resolved[&commands[0].aggregate.stream_key()];
        assert_eq!(u1.sequence, 0);
        assert_eq!(u1.resource_owner, "org1");
        assert!(!u1.existed);
    }
}
