//! Rate limiting wrapper for request handlers.
//!
//! [`with_rate_limit`] pairs a limiter with a rejection message. The result
//! can wrap any async handler ([`RateLimit::wrap`]) or sit in an axum router
//! as middleware ([`rate_limit`]). Either way the limiter is consulted once
//! per request: a throttled request gets a 429 and never reaches the handler,
//! an admitted one gets the handler's response with quota headers attached.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::{debug, info};

use crate::ratelimit::{ClientIdentity, RateLimitDecision, RateLimiterBackend};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Message used when none is given.
pub const DEFAULT_MESSAGE: &str = "Too many requests";

/// A handler result the wrapper knows how to decorate.
pub trait RateLimitedResponse: Sized {
    /// Build the throttled response in this type.
    fn from_rejection(rejection: RateLimitRejection) -> Self;

    /// The header collection to stamp quota headers onto.
    ///
    /// Types without one return `None` and pass through untouched.
    fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        None
    }
}

impl<B: From<String>> RateLimitedResponse for Response<B> {
    fn from_rejection(rejection: RateLimitRejection) -> Self {
        rejection.to_http_response()
    }

    fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        Some(Response::headers_mut(self))
    }
}

/// Everything a 429 reply carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    /// Human-readable reason
    pub message: String,
    /// Seconds until the window resets
    pub retry_after: u64,
    /// Configured ceiling
    pub limit: u32,
    /// Window end as ISO-8601
    pub reset: String,
}

impl RateLimitRejection {
    pub fn new(message: &str, limit: u32, decision: &RateLimitDecision, now: i64) -> Self {
        Self {
            message: message.to_string(),
            retry_after: decision.retry_after_secs(now),
            limit,
            reset: decision.reset_time_iso(),
        }
    }

    /// The JSON body: `{"error": .., "retryAfter": ..}`.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": self.message,
            "retryAfter": self.retry_after,
        })
    }

    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after));
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
        if let Ok(reset) = HeaderValue::from_str(&self.reset) {
            headers.insert(X_RATELIMIT_RESET, reset);
        }
        headers
    }

    /// Render as an HTTP response with any string-constructible body.
    pub fn to_http_response<B: From<String>>(&self) -> Response<B> {
        let mut response = Response::new(B::from(self.body().to_string()));
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        *response.headers_mut() = self.headers();
        response
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> axum::response::Response {
        self.to_http_response()
    }
}

/// Stamp the `X-RateLimit-*` headers for an admitted request.
pub fn insert_quota_headers(headers: &mut HeaderMap, limit: u32, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    if let Ok(reset) = HeaderValue::from_str(&decision.reset_time_iso()) {
        headers.insert(X_RATELIMIT_RESET, reset);
    }
}

/// Pair a limiter with the message its throttled clients will see.
pub fn with_rate_limit<L>(limiter: Arc<L>, message: impl Into<String>) -> RateLimit<L>
where
    L: RateLimiterBackend + ?Sized,
{
    RateLimit {
        limiter,
        message: Arc::from(message.into()),
    }
}

/// A limiter plus rejection message, ready to guard handlers.
pub struct RateLimit<L: ?Sized> {
    limiter: Arc<L>,
    message: Arc<str>,
}

impl<L: ?Sized> Clone for RateLimit<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            message: Arc::clone(&self.message),
        }
    }
}

impl<L: RateLimiterBackend + ?Sized> RateLimit<L> {
    /// Guard with the default message.
    pub fn new(limiter: Arc<L>) -> Self {
        with_rate_limit(limiter, DEFAULT_MESSAGE)
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Wrap a handler so every call goes through this guard.
    pub fn wrap<H>(&self, handler: H) -> RateLimited<L, H> {
        RateLimited {
            guard: self.clone(),
            handler,
        }
    }

    /// Admit or reject `request`, running `handler` only when admitted.
    ///
    /// A handler error is returned as-is; the admission it consumed stands.
    pub async fn run<B, F, Fut, R, E>(&self, request: Request<B>, handler: F) -> Result<R, E>
    where
        F: FnOnce(Request<B>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: RateLimitedResponse,
    {
        let identity = ClientIdentity::from_headers(request.headers());
        let decision = self.limiter.is_allowed(&identity);
        let limit = self.limiter.max_requests();

        if !decision.allowed {
            let rejection = RateLimitRejection::new(
                &self.message,
                limit,
                &decision,
                self.limiter.now_millis(),
            );
            debug!(client = %identity, "Rejected client");
            info!(
                method = %request.method(),
                path = %request.uri().path(),
                limit,
                retry_after = rejection.retry_after,
                "Request throttled"
            );
            return Ok(R::from_rejection(rejection));
        }

        let mut response = handler(request).await?;
        if let Some(headers) = response.headers_mut() {
            insert_quota_headers(headers, limit, &decision);
        }
        Ok(response)
    }
}

/// A handler behind a [`RateLimit`].
pub struct RateLimited<L: ?Sized, H> {
    guard: RateLimit<L>,
    handler: H,
}

impl<L: ?Sized, H: Clone> Clone for RateLimited<L, H> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<L: RateLimiterBackend + ?Sized, H> RateLimited<L, H> {
    /// Handle one request.
    pub async fn call<B, Fut, R, E>(&self, request: Request<B>) -> Result<R, E>
    where
        H: Fn(Request<B>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: RateLimitedResponse,
    {
        self.guard.run(request, |request| (self.handler)(request)).await
    }
}

/// Axum middleware applying a [`RateLimit`] to every request of a router.
///
/// Use with `axum::middleware::from_fn_with_state(guard, rate_limit::<L>)`.
pub async fn rate_limit<L>(
    State(guard): State<RateLimit<L>>,
    request: Request<Body>,
    next: Next,
) -> axum::response::Response
where
    L: RateLimiterBackend + ?Sized + 'static,
{
    let outcome = guard
        .run(request, |request| async move {
            Ok::<_, Infallible>(next.run(request).await)
        })
        .await;

    match outcome {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, RateLimiter, RateLimiterConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const START: i64 = 1_700_000_000_000;

    fn limiter(max_requests: u32) -> (Arc<RateLimiter>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let config = RateLimiterConfig::new(Duration::from_millis(1000), max_requests).unwrap();
        (Arc::new(RateLimiter::with_clock(config, clock.clone())), clock)
    }

    fn request(address: &str) -> Request<()> {
        Request::builder()
            .uri("/api/user")
            .header("x-forwarded-for", address)
            .header("user-agent", "test-agent")
            .body(())
            .unwrap()
    }

    async fn ok_handler(_request: Request<()>) -> Result<Response<String>, Infallible> {
        Ok(Response::new("ok".to_string()))
    }

    fn header<'a>(response: &'a Response<String>, name: &str) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn test_admitted_response_gets_quota_headers() {
        let (limiter, _clock) = limiter(3);
        let handler = with_rate_limit(limiter, "slow down").wrap(ok_handler);

        let response = handler.call(request("10.0.0.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "ok");
        assert_eq!(header(&response, "x-ratelimit-limit"), "3");
        assert_eq!(header(&response, "x-ratelimit-remaining"), "2");
        assert_eq!(header(&response, "x-ratelimit-reset"), "2023-11-14T22:13:21.000Z");
    }

    #[tokio::test]
    async fn test_rejected_request_skips_handler() {
        let (limiter, clock) = limiter(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = Arc::clone(&calls);
            move |_request: Request<()>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Infallible>(Response::new("ok".to_string())) }
            }
        };
        let handler = with_rate_limit(limiter, "Too many API requests").wrap(counted);

        handler.call(request("10.0.0.1")).await.unwrap();
        handler.call(request("10.0.0.1")).await.unwrap();
        clock.advance(Duration::from_millis(250));

        let response = handler.call(request("10.0.0.1")).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "content-type"), "application/json");
        assert_eq!(header(&response, "retry-after"), "1");
        assert_eq!(header(&response, "x-ratelimit-limit"), "2");
        assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
        assert_eq!(header(&response, "x-ratelimit-reset"), "2023-11-14T22:13:21.000Z");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["error"], "Too many API requests");
        assert_eq!(body["retryAfter"], 1);
    }

    #[tokio::test]
    async fn test_handler_error_propagates_and_keeps_admission() {
        let (limiter, _clock) = limiter(3);
        let failing = |_request: Request<()>| async {
            Err::<Response<String>, _>("database unavailable")
        };
        let handler = with_rate_limit(Arc::clone(&limiter), "slow down").wrap(failing);

        let result = handler.call(request("10.0.0.1")).await;

        assert_eq!(result.unwrap_err(), "database unavailable");
        let identity = ClientIdentity::new("10.0.0.1", "test-agent");
        assert_eq!(limiter.get_entry(&identity).unwrap().count, 1);
    }

    #[derive(Debug, PartialEq)]
    struct Plain(String);

    impl RateLimitedResponse for Plain {
        fn from_rejection(rejection: RateLimitRejection) -> Self {
            Plain(rejection.message)
        }
    }

    #[test]
    fn test_headerless_result_passes_through() {
        let (limiter, _clock) = limiter(1);
        let handler = with_rate_limit(limiter, "throttled")
            .wrap(|_request: Request<()>| async { Ok::<_, Infallible>(Plain("body".into())) });

        let first = tokio_test::block_on(handler.call(request("10.0.0.1"))).unwrap();
        assert_eq!(first, Plain("body".into()));

        let second = tokio_test::block_on(handler.call(request("10.0.0.1"))).unwrap();
        assert_eq!(second, Plain("throttled".into()));
    }

    #[tokio::test]
    async fn test_clients_are_counted_separately() {
        let (limiter, _clock) = limiter(1);
        let handler = with_rate_limit(limiter, "slow down").wrap(ok_handler);

        let first = handler.call(request("192.168.1.1, 10.0.0.1")).await.unwrap();
        let blocked = handler.call(request("192.168.1.1")).await.unwrap();
        let other = handler.call(request("192.168.1.2")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[test]
    fn test_default_message() {
        let (limiter, _clock) = limiter(1);
        assert_eq!(RateLimit::new(limiter).message(), "Too many requests");
    }

    #[test]
    fn test_rejection_into_axum_response() {
        let rejection = RateLimitRejection {
            message: "nope".to_string(),
            retry_after: 30,
            limit: 10,
            reset: "2023-11-14T22:13:21.000Z".to_string(),
        };

        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "30");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
    }
}
