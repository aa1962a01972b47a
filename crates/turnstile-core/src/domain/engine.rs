//! Admission decision engine.
//!
//! Per key the engine moves between three states, all held in the
//! [`CounterStore`]:
//!
//! - **Fresh** - no record, or a record without a live expiry
//! - **Active** - a window counter below the limit
//! - **Blocked** - the block marker, until its expiry elapses
//!
//! The window expiry is pushed forward on every admitted request, so the
//! window rolls rather than resetting on a fixed clock boundary.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Deadline, IdentityKey, Record};
use crate::ports::{CounterStore, IncrementOutcome, StoreError};

/// Engine timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Span over which requests are counted.
    pub window: Duration,
    /// Penalty imposed once a key exceeds its limit.
    pub block_duration: Duration,
    /// Budget for all store calls of one evaluation.
    pub store_timeout: Duration,
}

/// Outcome of one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed { remaining: u32, reset_in: Duration },
    Denied { retry_after: Duration },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }
}

/// Decides whether a request for an identity may proceed.
pub struct RateDecisionEngine {
    store: Arc<dyn CounterStore>,
    config: EngineConfig,
}

impl RateDecisionEngine {
    pub fn new(store: Arc<dyn CounterStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Evaluate one request for `key` against `limit`, bounding all store
    /// calls by the configured store timeout.
    pub async fn evaluate(&self, key: &IdentityKey, limit: u32) -> Result<Verdict, StoreError> {
        let deadline = Deadline::after(self.config.store_timeout);
        self.evaluate_with_deadline(key, limit, deadline).await
    }

    /// Evaluate one request for `key` against `limit` with an explicit deadline.
    ///
    /// Any store failure aborts the evaluation and is returned as-is.
    pub async fn evaluate_with_deadline(
        &self,
        key: &IdentityKey,
        limit: u32,
        deadline: Deadline,
    ) -> Result<Verdict, StoreError> {
        let key = key.to_string();
        let window = self.config.window;
        let snapshot = self.store.read(&key, deadline).await?;
        let live_ttl = snapshot.ttl.filter(|ttl| !ttl.is_zero());

        match (snapshot.record, live_ttl) {
            (Some(Record::Blocked), Some(ttl)) => {
                return Ok(Verdict::Denied { retry_after: ttl });
            }
            (Some(Record::Counter(count)), Some(_)) if count >= u64::from(limit) => {
                return self.block(&key, deadline).await;
            }
            (Some(_), Some(_)) => {}
            (None, _) => {
                // Losing this race just means another caller opened the window.
                self.store
                    .set_if_absent(&key, Record::Counter(0), window, deadline)
                    .await?;
            }
            (Some(_), None) => {
                self.store
                    .set_with_expiry(&key, Record::Counter(0), window, deadline)
                    .await?;
            }
        }

        let count = match self
            .store
            .increment_and_refresh(&key, window, deadline)
            .await?
        {
            IncrementOutcome::Counted(count) => count,
            IncrementOutcome::Blocked => {
                // Blocked by a concurrent caller between our read and increment.
                let retry_after = self
                    .store
                    .time_to_live(&key, deadline)
                    .await?
                    .filter(|ttl| !ttl.is_zero())
                    .unwrap_or(self.config.block_duration);
                return Ok(Verdict::Denied { retry_after });
            }
        };

        match u64::from(limit).checked_sub(count) {
            Some(remaining) => Ok(Verdict::Allowed {
                remaining: remaining as u32,
                reset_in: window,
            }),
            None => self.block(&key, deadline).await,
        }
    }

    async fn block(&self, key: &str, deadline: Deadline) -> Result<Verdict, StoreError> {
        let block_duration = self.config.block_duration;
        self.store
            .set_with_expiry(key, Record::Blocked, block_duration, deadline)
            .await?;
        Ok(Verdict::Denied {
            retry_after: block_duration,
        })
    }
}
