//! Configuration for the event store and its Postgres backend.
//!
//! Everything has a default except the database URL. `from_env` reads:
//!
//! | variable | default |
//! |----------|---------|
//! | `EVENTVAULT_MAX_RETRIES` | 10 |
//! | `EVENTVAULT_RETRY_DELAY_MS` | 5 |
//! | `EVENTVAULT_PUSH_TIMEOUT_MS` | 30000 |
//! | `DATABASE_URL` | required |
//! | `EVENTVAULT_MAX_CONNECTIONS` | 10 |

use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::info;

use crate::retry::RetryPolicy;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

fn read_env<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                name,
                value,
                reason: e.to_string(),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::Invalid {
            name,
            value: String::new(),
            reason: e.to_string(),
        }),
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStoreConfig {
    pub retry: RetryPolicy,
    /// Bound on a whole push call, retries included.
    pub push_timeout: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            push_timeout: Duration::from_secs(30),
        }
    }
}

impl EventStoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(max_retries) = read_env::<u32>("EVENTVAULT_MAX_RETRIES")? {
            config.retry.max_retries = max_retries;
        }
        if let Some(delay_ms) = read_env::<u64>("EVENTVAULT_RETRY_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(delay_ms);
        }
        if let Some(timeout_ms) = read_env::<u64>("EVENTVAULT_PUSH_TIMEOUT_MS")? {
            config.push_timeout = Duration::from_millis(timeout_ms);
        }
        Ok(config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }
}

/// Connection settings for [`crate::store::PostgresStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = read_env::<String>("DATABASE_URL")?.ok_or(ConfigError::Missing {
            name: "DATABASE_URL",
        })?;
        let mut config = Self::new(database_url);
        if let Some(max) = read_env::<u32>("EVENTVAULT_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        Ok(config)
    }

    pub async fn connect(&self) -> Result<PgPool, StoreError> {
        info!(max_connections = self.max_connections, "connecting to postgres");
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .map_err(|e| StoreError::database("connect", e))
    }
}
