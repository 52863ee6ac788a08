//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, with_rate_limit, RateLimit};
use super::routes;
use crate::config::RateLimitingConfig;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{LimitRule, RateLimiter};

/// The three independent limiters the service runs.
///
/// Built once at startup and torn down with [`Limiters::destroy`] when the
/// server stops. Exhausting one never affects the others.
#[derive(Clone)]
pub struct Limiters {
    pub auth: RateLimit<RateLimiter>,
    pub api: RateLimit<RateLimiter>,
    pub user_data: RateLimit<RateLimiter>,
}

impl Limiters {
    /// Create the limiters described by configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        Ok(Self {
            auth: guard(config, &config.auth)?,
            api: guard(config, &config.api)?,
            user_data: guard(config, &config.user_data)?,
        })
    }

    /// Stop every limiter's background sweep and drop its state.
    pub fn destroy(&self) {
        for guard in [&self.auth, &self.api, &self.user_data] {
            guard.limiter().destroy();
        }
    }
}

fn guard(config: &RateLimitingConfig, rule: &LimitRule) -> Result<RateLimit<RateLimiter>> {
    let limiter = RateLimiter::new(config.limiter_config(rule)?);
    info!(
        window_ms = rule.window_ms,
        max_requests = rule.max_requests,
        "Rate limiter initialized"
    );
    Ok(with_rate_limit(Arc::new(limiter), rule.message.clone()))
}

/// HTTP server for the gated API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    limiters: Limiters,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiters: Limiters) -> Self {
        Self { addr, limiters }
    }

    /// Build the router, each endpoint class behind its own limiter.
    pub fn router(&self) -> Router {
        let auth = Router::new()
            .route("/api/auth/{*path}", any(routes::auth))
            .route_layer(from_fn_with_state(
                self.limiters.auth.clone(),
                rate_limit::<RateLimiter>,
            ));

        let user_data = Router::new()
            .route("/api/user", get(routes::current_client))
            .route_layer(from_fn_with_state(
                self.limiters.user_data.clone(),
                rate_limit::<RateLimiter>,
            ));

        let api = Router::new()
            .route("/api/{*path}", any(routes::not_found))
            .route_layer(from_fn_with_state(
                self.limiters.api.clone(),
                rate_limit::<RateLimiter>,
            ));

        Router::new()
            .route("/health", get(routes::health))
            .merge(auth)
            .merge(user_data)
            .merge(api)
    }

    /// Serve until `signal` resolves, then destroy the limiters.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "Starting HTTP server");

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TurnstileError::Io(e)
            });

        self.limiters.destroy();
        result
    }
}
