//! Shared tracing setup for binaries and tests embedding the event store.

pub mod logging;

pub use logging::{LogConfig, LogFormat, ParseLogFormatError};

/// Install the process-wide subscriber from `RUST_LOG` / `EVENTVAULT_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops. An unparseable
/// format falls back to JSON.
pub fn init() {
    let config = LogConfig::from_env().unwrap_or_default();
    logging::init(&config);
}
