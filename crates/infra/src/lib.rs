//! Storage side of the event store: backends, the push pipeline and sessions.
//!
//! - [`EventStore`]: atomic batch pushes with bounded retry and a timeout,
//!   plus `filter` / `reduce` reads.
//! - [`Session`]: collects commands and saves them as one batch.
//! - [`store`]: the [`Store`] / [`StoreTx`] boundary with Postgres and in-memory
//!   backends.
//! - [`config`]: engine and connection settings, from code or the environment.

pub mod config;
pub mod event_store;
mod push;
pub mod retry;
pub mod sequence;
pub mod session;
pub mod store;
pub mod unique_constraint;

pub use config::{ConfigError, EventStoreConfig, PostgresConfig};
pub use event_store::EventStore;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use session::Session;
pub use store::{InMemoryStore, PostgresStore, Store, StoreError, StoreTx};
