//! # Turnstile Shared
//!
//! Wire types shared between the server and its clients.

pub mod headers;
pub mod response;

pub use response::ErrorResponse;
