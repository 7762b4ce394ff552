//! Broadcast routing and per-connection input admission.

pub mod broadcast;
pub mod rate_limit;

pub use broadcast::{BroadcastRouter, ConnectionId};
pub use rate_limit::{RateLimitConfig, TokenBucket};
