use std::time::Duration;

use tokio::time::Instant;

/// The instant after which a store call is abandoned.
///
/// Built on `tokio::time::Instant` so that paused test clocks apply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        // Absurd timeouts saturate to one day rather than overflow.
        Self(
            now.checked_add(timeout)
                .unwrap_or_else(|| now + Duration::from_secs(86_400)),
        )
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn instant(self) -> Instant {
        self.0
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn has_passed(self) -> bool {
        Instant::now() >= self.0
    }
}
