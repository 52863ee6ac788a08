//! HTTP layer: the rate limiting wrapper and the server that hosts it.

pub mod middleware;
pub mod routes;
mod server;

pub use middleware::{
    rate_limit, with_rate_limit, RateLimit, RateLimitRejection, RateLimited, RateLimitedResponse,
};
pub use server::{HttpServer, Limiters};
