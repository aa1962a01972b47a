//! Counter store port.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{Deadline, Record};

/// Counter store trait - abstraction over TTL-capable key-value backends
/// (Redis, in-memory).
///
/// Every call carries a [`Deadline`]; implementations must give up with
/// [`StoreError::Timeout`] once it has passed.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Get the record stored under `key`, if any.
    async fn get(&self, key: &str, deadline: Deadline) -> Result<Option<Record>, StoreError>;

    /// Atomically increment the window counter under `key` and reset its
    /// expiry to `window`.
    ///
    /// An absent key is created with a count of 1. A block marker is left
    /// untouched and reported as [`IncrementOutcome::Blocked`].
    async fn increment_and_refresh(
        &self,
        key: &str,
        window: Duration,
        deadline: Deadline,
    ) -> Result<IncrementOutcome, StoreError>;

    /// Upsert `record` under `key` with a fresh expiry of `ttl`.
    async fn set_with_expiry(
        &self,
        key: &str,
        record: Record,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<(), StoreError>;

    /// Store `record` under `key` with expiry `ttl` only if the key is absent.
    /// Returns `true` if the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        record: Record,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<bool, StoreError>;

    /// Remaining time-to-live of `key`. `None` if the key is absent or has
    /// no expiry.
    async fn time_to_live(&self, key: &str, deadline: Deadline)
    -> Result<Option<Duration>, StoreError>;

    /// Read the record and its remaining TTL together.
    ///
    /// The default issues two calls; backends that can answer in one round
    /// trip should override it.
    async fn read(&self, key: &str, deadline: Deadline) -> Result<RecordSnapshot, StoreError> {
        let record = self.get(key, deadline).await?;
        let ttl = match record {
            Some(_) => self.time_to_live(key, deadline).await?,
            None => None,
        };
        Ok(RecordSnapshot { record, ttl })
    }
}

/// A record together with its remaining TTL, as seen at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordSnapshot {
    pub record: Option<Record>,
    pub ttl: Option<Duration>,
}

impl RecordSnapshot {
    /// True if the record exists and still has time left on its expiry.
    pub fn is_live(&self) -> bool {
        self.record.is_some() && self.ttl.is_some_and(|ttl| !ttl.is_zero())
    }
}

/// Result of [`CounterStore::increment_and_refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// The counter was incremented to this value.
    Counted(u64),
    /// The key holds a block marker; nothing was changed.
    Blocked,
}

/// Counter store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Store call exceeded its deadline")]
    Timeout,

    #[error("Unexpected store response: {0}")]
    Protocol(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}
