//! Retry decorator for counter stores.
//!
//! Transient failures (see [`StoreError::is_transient`]) are retried with
//! exponential backoff:
//!
//! - delay for retry `n` (1-indexed) is `initial_delay * multiplier^(n-1)`,
//!   clamped to `max_delay`
//! - at most `max_attempts` calls are made in total
//! - a retry is only attempted if its delay ends before the call's deadline
//!
//! Increments are retried too. A retried increment whose first attempt did
//! land over-counts by one, which only ever makes the limiter stricter.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use turnstile_core::domain::{Deadline, Record};
use turnstile_core::ports::{CounterStore, IncrementOutcome, RecordSnapshot, StoreError};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total calls per operation, including the first. 0 behaves like 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Configuration that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();

        // Handles NaN, Inf and negative products.
        let clamped = if base.is_nan() || base < 0.0 {
            0.0
        } else {
            base.min(max)
        };
        Duration::from_secs_f64(clamped)
    }
}

/// Wraps a [`CounterStore`] and retries its transient failures.
pub struct RetryingStore<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: CounterStore> RetryingStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn run<T, F, Fut>(
        &self,
        op: &'static str,
        deadline: Deadline,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= max_attempts {
                return Err(error);
            }

            let delay = self.config.delay_for(attempt);
            if delay >= deadline.remaining() {
                tracing::debug!(op, attempt, "No time left before deadline, not retrying");
                return Err(error);
            }

            tracing::warn!(
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient store error, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for RetryingStore<S> {
    async fn get(&self, key: &str, deadline: Deadline) -> Result<Option<Record>, StoreError> {
        self.run("get", deadline, || self.inner.get(key, deadline))
            .await
    }

    async fn increment_and_refresh(
        &self,
        key: &str,
        window: Duration,
        deadline: Deadline,
    ) -> Result<IncrementOutcome, StoreError> {
        self.run("increment_and_refresh", deadline, || {
            self.inner.increment_and_refresh(key, window, deadline)
        })
        .await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        record: Record,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        self.run("set_with_expiry", deadline, || {
            self.inner.set_with_expiry(key, record, ttl, deadline)
        })
        .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        record: Record,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<bool, StoreError> {
        self.run("set_if_absent", deadline, || {
            self.inner.set_if_absent(key, record, ttl, deadline)
        })
        .await
    }

    async fn time_to_live(
        &self,
        key: &str,
        deadline: Deadline,
    ) -> Result<Option<Duration>, StoreError> {
        self.run("time_to_live", deadline, || self.inner.time_to_live(key, deadline))
            .await
    }

    async fn read(&self, key: &str, deadline: Deadline) -> Result<RecordSnapshot, StoreError> {
        self.run("read", deadline, || self.inner.read(key, deadline))
            .await
    }
}
