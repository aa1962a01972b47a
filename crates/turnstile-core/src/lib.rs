//! # Turnstile Core
//!
//! The domain layer of Turnstile.
//! This crate holds the admission decision engine and the `CounterStore` port
//! it drives. It performs no I/O of its own.

pub mod domain;
pub mod error;
pub mod ports;

pub use domain::{
    Deadline, EngineConfig, IdentityKey, LimitPolicy, RateDecisionEngine, Record, Verdict,
};
pub use error::ConfigError;
pub use ports::{CounterStore, StoreError};
