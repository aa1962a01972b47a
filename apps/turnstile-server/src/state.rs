//! Application state - shared across all handlers.

use std::sync::Arc;
use std::time::Duration;

use turnstile_core::ports::{CounterStore, StoreError};
use turnstile_core::{EngineConfig, RateDecisionEngine};
use turnstile_infra::InMemoryCounterStore;

#[cfg(feature = "redis")]
use turnstile_infra::{RedisConfig, RedisCounterStore, RetryingStore};

use crate::config::{AppConfig, StoreSettings};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RateDecisionEngine>,
    pub store_backend: &'static str,
}

impl AppState {
    /// Build the application state, connecting to the configured store.
    ///
    /// A store that cannot be reached is fatal: there is no silent fallback
    /// to per-process counting.
    pub async fn new(config: &AppConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn CounterStore> = match &config.store {
            #[cfg(feature = "redis")]
            StoreSettings::Redis {
                addr,
                password,
                db,
                connect_timeout,
                key_prefix,
            } => {
                let redis = RedisCounterStore::new(RedisConfig {
                    addr: addr.clone(),
                    password: password.clone(),
                    db: *db,
                    connect_timeout: *connect_timeout,
                    key_prefix: key_prefix.clone(),
                })
                .await?;
                Arc::new(RetryingStore::new(redis, config.retry.clone()))
            }
            #[cfg(not(feature = "redis"))]
            StoreSettings::Redis { .. } => {
                return Err(StoreError::Connection(
                    "server built without the redis feature".to_string(),
                ));
            }
            StoreSettings::Memory => {
                tracing::warn!("Using in-memory counter store - limits are per-process");
                let memory = Arc::new(InMemoryCounterStore::new());
                spawn_purge(memory.clone(), config.engine.window);
                memory
            }
        };

        tracing::info!(store = config.store.backend_name(), "Application state initialized");

        Ok(Self::with_store(
            store,
            config.engine,
            config.store.backend_name(),
        ))
    }

    pub fn with_store(
        store: Arc<dyn CounterStore>,
        engine: EngineConfig,
        store_backend: &'static str,
    ) -> Self {
        Self {
            engine: Arc::new(RateDecisionEngine::new(store, engine)),
            store_backend,
        }
    }
}

/// Periodically drop expired counters so idle identities do not accumulate.
fn spawn_purge(store: Arc<InMemoryCounterStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired().await;
            if purged > 0 {
                let live = store.len().await;
                tracing::debug!(purged, live, "Purged expired counters");
            }
        }
    });
}
