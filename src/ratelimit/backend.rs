//! Rate limiter trait for abstracting the limiter behind the HTTP wrapper.

use super::entry::RateLimitDecision;
use super::identity::ClientIdentity;

/// Trait for admission-control implementations.
///
/// The HTTP wrapper is generic over this so it can sit in front of any
/// limiter that can make a synchronous admit/reject decision.
pub trait RateLimiterBackend: Send + Sync {
    /// Count a request from `identity` and decide whether to admit it.
    fn is_allowed(&self, identity: &ClientIdentity) -> RateLimitDecision;

    /// The per-window ceiling, reported in `X-RateLimit-Limit`.
    fn max_requests(&self) -> u32;

    /// The limiter's notion of now, in epoch milliseconds.
    fn now_millis(&self) -> i64;
}
