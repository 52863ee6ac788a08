//! Turnstile - In-memory fixed-window rate limiting
//!
//! This crate throttles HTTP request handlers per client. Each limiter counts
//! requests per key (client address and agent by default) in fixed windows,
//! rejects with a structured 429 once the quota is spent, and sweeps expired
//! state in the background.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
