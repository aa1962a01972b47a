//! Redis counter store using a Lua script for atomic increment-and-refresh.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, IntoConnectionInfo, RedisError, Script};

use turnstile_core::domain::{BLOCK_SENTINEL, Deadline, Record};
use turnstile_core::ports::{CounterStore, IncrementOutcome, RecordSnapshot, StoreError};

/// Increments a window counter and resets its expiry in one step.
/// A block marker is returned unchanged instead of being incremented.
const INCREMENT_AND_REFRESH: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
local sentinel = tonumber(ARGV[2])

local current = tonumber(redis.call('GET', key))
if current == sentinel then
    return sentinel
end

local count = redis.call('INCR', key)
redis.call('PEXPIRE', key, window_ms)
return count
"#;

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// `host:port` of the Redis server
    pub addr: String,
    /// Password, if the server requires one
    pub password: Option<String>,
    /// Database index
    pub db: i64,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Prefix prepended to every counter key
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(5),
            key_prefix: "ratelimit".to_string(),
        }
    }
}

/// Redis-backed counter store.
///
/// Uses connection manager for automatic reconnection.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    config: RedisConfig,
    script: Script,
}

impl RedisCounterStore {
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let mut info = format!("redis://{}", config.addr)
            .as_str()
            .into_connection_info()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info.redis.db = config.db;
        info.redis.password = config.password.clone().filter(|p| !p.is_empty());

        let client = Client::open(info).map_err(|e| StoreError::Connection(e.to_string()))?;

        // Use timeout to prevent hanging if Redis is unreachable
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Connection("Connection timed out".to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::info!(addr = %config.addr, db = config.db, "Connected to Redis counter store");

        Ok(Self {
            conn,
            config,
            script: Script::new(INCREMENT_AND_REFRESH),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    /// Run one Redis call, bounded by `deadline`.
    async fn bounded<T, F>(&self, key: &str, deadline: Deadline, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout_at(deadline.instant(), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Redis call failed");
                Err(map_redis_error(e))
            }
            Err(_) => {
                tracing::warn!(key = %key, "Redis call exceeded its deadline");
                Err(StoreError::Timeout)
            }
        }
    }
}

fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        StoreError::Connection(e.to_string())
    } else if e.kind() == redis::ErrorKind::TypeError {
        StoreError::Protocol(e.to_string())
    } else {
        StoreError::Operation(e.to_string())
    }
}

fn decode(raw: i64) -> Result<Record, StoreError> {
    Record::from_raw(raw).ok_or_else(|| StoreError::Protocol(format!("invalid counter value {}", raw)))
}

/// Map a `PTTL` reply: -2 (absent) and -1 (no expiry) become `None`.
fn decode_ttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

fn millis(duration: Duration) -> u64 {
    // PX / PEXPIRE reject zero.
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str, deadline: Deadline) -> Result<Option<Record>, StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();
        let raw: Option<i64> = self.bounded(key, deadline, conn.get(&redis_key)).await?;
        raw.map(decode).transpose()
    }

    async fn increment_and_refresh(
        &self,
        key: &str,
        window: Duration,
        deadline: Deadline,
    ) -> Result<IncrementOutcome, StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();

        let mut invocation = self.script.key(&redis_key);
        invocation.arg(millis(window)).arg(BLOCK_SENTINEL);
        let count: i64 = self
            .bounded(key, deadline, invocation.invoke_async(&mut conn))
            .await?;

        match decode(count)? {
            Record::Blocked => Ok(IncrementOutcome::Blocked),
            Record::Counter(count) => Ok(IncrementOutcome::Counted(count)),
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        record: Record,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();
        self.bounded(
            key,
            deadline,
            conn.pset_ex::<_, _, ()>(&redis_key, record.to_raw(), millis(ttl)),
        )
        .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        record: Record,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<bool, StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(&redis_key)
            .arg(record.to_raw())
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl));
        let reply: Option<String> = self
            .bounded(key, deadline, cmd.query_async(&mut conn))
            .await?;
        Ok(reply.is_some())
    }

    async fn time_to_live(
        &self,
        key: &str,
        deadline: Deadline,
    ) -> Result<Option<Duration>, StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();
        let pttl: i64 = self.bounded(key, deadline, conn.pttl(&redis_key)).await?;
        Ok(decode_ttl(pttl))
    }

    async fn read(&self, key: &str, deadline: Deadline) -> Result<RecordSnapshot, StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().get(&redis_key).pttl(&redis_key);
        let (raw, pttl): (Option<i64>, i64) = self
            .bounded(key, deadline, pipe.query_async(&mut conn))
            .await?;

        Ok(RecordSnapshot {
            record: raw.map(decode).transpose()?,
            ttl: decode_ttl(pttl),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_test_store(prefix: &str) -> Option<RedisCounterStore> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6389".to_string());
        let config = RedisConfig {
            addr: url.trim_start_matches("redis://").to_string(),
            password: None,
            db: 1,
            connect_timeout: Duration::from_secs(1),
            key_prefix: prefix.to_string(),
        };

        RedisCounterStore::new(config).await.ok()
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(2))
    }

    #[test]
    fn test_decode_ttl() {
        assert_eq!(decode_ttl(-2), None);
        assert_eq!(decode_ttl(-1), None);
        assert_eq!(decode_ttl(1500), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(3)), 3000);
        assert_eq!(millis(Duration::from_secs(u64::MAX)), u64::MAX);
    }

    #[test]
    fn test_decode_rejects_unknown_negatives() {
        assert!(matches!(decode(-7), Err(StoreError::Protocol(_))));
        assert_eq!(decode(-1).unwrap(), Record::Blocked);
    }

    #[tokio::test]
    async fn test_redis_increment_and_block() {
        let store = match get_test_store("test_turnstile_incr").await {
            Some(s) => s,
            None => {
                tracing::warn!("Redis not available, skipping test");
                return;
            }
        };

        let key = "ip:10.1.1.1";
        let window = Duration::from_secs(2);
        store
            .set_with_expiry(key, Record::Counter(0), window, deadline())
            .await
            .unwrap();

        assert_eq!(
            store.increment_and_refresh(key, window, deadline()).await.unwrap(),
            IncrementOutcome::Counted(1)
        );
        let snapshot = store.read(key, deadline()).await.unwrap();
        assert_eq!(snapshot.record, Some(Record::Counter(1)));
        assert!(snapshot.is_live());

        store
            .set_with_expiry(key, Record::Blocked, Duration::from_secs(5), deadline())
            .await
            .unwrap();
        assert_eq!(
            store.increment_and_refresh(key, window, deadline()).await.unwrap(),
            IncrementOutcome::Blocked
        );
        assert_eq!(store.get(key, deadline()).await.unwrap(), Some(Record::Blocked));
    }

    #[tokio::test]
    async fn test_redis_set_if_absent_and_expiry() {
        let store = match get_test_store("test_turnstile_nx").await {
            Some(s) => s,
            None => return,
        };

        let key = "token:nx";
        let ttl = Duration::from_millis(500);
        store
            .set_with_expiry(key, Record::Counter(9), Duration::from_millis(1), deadline())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.set_if_absent(key, Record::Counter(0), ttl, deadline()).await.unwrap());
        assert!(!store.set_if_absent(key, Record::Counter(0), ttl, deadline()).await.unwrap());

        // Wait for expiration
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(store.get(key, deadline()).await.unwrap(), None);
        assert_eq!(store.time_to_live(key, deadline()).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_redis_engine_admits_exactly_limit_under_concurrency() {
        use std::sync::Arc;
        use std::time::{SystemTime, UNIX_EPOCH};
        use turnstile_core::{EngineConfig, IdentityKey, RateDecisionEngine};

        const LIMIT: u32 = 5;
        const REQUESTS: usize = 40;

        let store = match get_test_store("test_turnstile_race").await {
            Some(s) => s,
            None => return,
        };
        let engine = Arc::new(RateDecisionEngine::new(
            Arc::new(store),
            EngineConfig {
                window: Duration::from_secs(10),
                block_duration: Duration::from_secs(10),
                store_timeout: Duration::from_secs(2),
            },
        ));

        // Fresh key per run so leftovers from earlier runs do not interfere.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let key = IdentityKey::from_token(&format!("race-{}", nanos)).unwrap();

        let handles: Vec<_> = (0..REQUESTS)
            .map(|_| {
                let engine = engine.clone();
                let key = key.clone();
                tokio::spawn(async move { engine.evaluate(&key, LIMIT).await })
            })
            .collect();

        let allowed = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|verdict| verdict.is_allowed())
            .count();

        assert_eq!(allowed, LIMIT as usize);
    }
}
