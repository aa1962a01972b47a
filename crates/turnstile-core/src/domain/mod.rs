//! Domain entities - identities, counter records and the decision engine.

mod deadline;
mod engine;
mod identity;
mod record;

pub use deadline::Deadline;
pub use engine::{EngineConfig, RateDecisionEngine, Verdict};
pub use identity::{IdentityKey, LimitPolicy};
pub use record::{BLOCK_SENTINEL, Record};
