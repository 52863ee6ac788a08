//! Rate limiting logic and state management.

mod backend;
mod clock;
mod entry;
mod identity;
mod limiter;
mod rules;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{RateLimitDecision, RateLimitEntry};
pub use identity::{client_address, user_agent, ClientIdentity, FALLBACK_ADDRESS, UNKNOWN};
pub use limiter::RateLimiter;
pub use rules::{KeyGenerator, LimitRule, RateLimiterConfig, DEFAULT_CLEANUP_INTERVAL, MAX_WINDOW};
