//! Counter store implementations - Redis and in-memory, plus a retrying
//! decorator for either.

mod memory;
mod retry;


pub use memory::InMemoryCounterStore;
pub use retry::{RetryConfig, RetryingStore};

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::{RedisConfig, RedisCounterStore};
