//! # Turnstile Infrastructure
//!
//! Concrete implementations of the `CounterStore` port defined in
//! `turnstile-core`.
//!
//! ## Feature Flags
//!
//! - `full` (default) - All features enabled
//! - `minimal` - No external dependencies, in-memory only
//! - `redis` - Redis counter store

pub mod store;

// Re-exports - In-Memory
pub use store::{InMemoryCounterStore, RetryConfig, RetryingStore};

// Re-exports - Redis
#[cfg(feature = "redis")]
pub use store::{RedisConfig, RedisCounterStore};
