//! In-memory counter store - for single-process deployments and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use turnstile_core::domain::{Deadline, Record};
use turnstile_core::ports::{CounterStore, IncrementOutcome, RecordSnapshot, StoreError};

struct Entry {
    record: Record,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// In-memory counter store using a HashMap behind an async mutex.
///
/// Every operation runs under the one lock, so each is atomic with respect
/// to the others.
/// Note: Counts are per-process and lost on restart.
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(
        &self,
        deadline: Deadline,
    ) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        if deadline.has_passed() {
            return Err(StoreError::Timeout);
        }
        tokio::time::timeout_at(deadline.instant(), self.entries.lock())
            .await
            .map_err(|_| StoreError::Timeout)
    }

    /// Live entry under `key`, evicting it first if it has expired.
    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Instant at which an entry written now with `ttl` expires.
fn expiry(now: Instant, ttl: Duration) -> Result<Instant, StoreError> {
    now.checked_add(ttl)
        .ok_or_else(|| StoreError::Operation(format!("expiry of {:?} is out of range", ttl)))
}

fn ttl_of(entry: &Entry, now: Instant) -> Option<Duration> {
    entry
        .expires_at
        .map(|exp| exp.saturating_duration_since(now))
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str, deadline: Deadline) -> Result<Option<Record>, StoreError> {
        let mut entries = self.lock(deadline).await?;
        Ok(Self::live(&mut entries, key, Instant::now()).map(|entry| entry.record))
    }

    async fn increment_and_refresh(
        &self,
        key: &str,
        window: Duration,
        deadline: Deadline,
    ) -> Result<IncrementOutcome, StoreError> {
        let mut entries = self.lock(deadline).await?;
        let now = Instant::now();

        let count = match Self::live(&mut entries, key, now).map(|entry| entry.record) {
            Some(Record::Blocked) => return Ok(IncrementOutcome::Blocked),
            Some(Record::Counter(count)) => count.saturating_add(1),
            None => 1,
        };

        entries.insert(
            key.to_string(),
            Entry {
                record: Record::Counter(count),
                expires_at: Some(expiry(now, window)?),
            },
        );

        Ok(IncrementOutcome::Counted(count))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        record: Record,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        let mut entries = self.lock(deadline).await?;
        let expires_at = expiry(Instant::now(), ttl)?;
        entries.insert(
            key.to_string(),
            Entry {
                record,
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        record: Record,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock(deadline).await?;
        let now = Instant::now();
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        let expires_at = expiry(now, ttl)?;
        entries.insert(
            key.to_string(),
            Entry {
                record,
                expires_at: Some(expires_at),
            },
        );
        Ok(true)
    }

    async fn time_to_live(
        &self,
        key: &str,
        deadline: Deadline,
    ) -> Result<Option<Duration>, StoreError> {
        let mut entries = self.lock(deadline).await?;
        let now = Instant::now();
        Ok(Self::live(&mut entries, key, now).and_then(|entry| ttl_of(entry, now)))
    }

    async fn read(&self, key: &str, deadline: Deadline) -> Result<RecordSnapshot, StoreError> {
        let mut entries = self.lock(deadline).await?;
        let now = Instant::now();
        Ok(match Self::live(&mut entries, key, now) {
            Some(entry) => RecordSnapshot {
                record: Some(entry.record),
                ttl: ttl_of(entry, now),
            },
            None => RecordSnapshot::default(),
        })
    }
}
