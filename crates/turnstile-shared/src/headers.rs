//! Rate-limit response header names (lowercase, as sent on the wire).

/// Limit applied to the caller's identity.
pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";

/// Requests left in the current window.
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Seconds until the current window expires.
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Seconds the caller must wait before retrying.
pub const RETRY_AFTER: &str = "retry-after";
