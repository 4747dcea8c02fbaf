//! `eventvault-core`: event store domain primitives.
//!
//! Aggregates, commands, events, unique constraints and search queries.
//! No I/O lives here; storage backends and the write pipeline are in `eventvault-infra`.

pub mod aggregate;
pub mod command;
pub mod error;
pub mod event;
pub mod id;
pub mod search;
pub mod unique_constraint;

pub use aggregate::{Aggregate, AggregateVersion, StreamKey};
pub use command::Command;
pub use error::{BoxError, EventStoreError, EventStoreResult};
pub use event::Event;
pub use id::{AggregateId, AggregateType, EventType, GLOBAL_TENANT, TenantId, UniqueType};
pub use search::{QueryGroup, QueryGroupBuilder, SearchQuery, SearchQueryBuilder, SortOrder};
pub use unique_constraint::{UniqueConstraint, UniqueConstraintAction};
