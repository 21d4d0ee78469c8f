//! Rate limit headers and the 429 response.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ratelimit::{BackendKind, Decision};

pub static RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub static RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub static RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
pub static RATELIMIT_BACKEND: HeaderName = HeaderName::from_static("x-ratelimit-backend");

#[derive(Debug, Serialize)]
struct RateLimitedBody {
    success: bool,
    error: &'static str,
    code: &'static str,
    limit: u64,
    remaining: u64,
    /// Seconds until the window resets
    reset: u64,
}

/// Add `RateLimit-Limit`, `RateLimit-Remaining` and `RateLimit-Reset`.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(RATELIMIT_REMAINING.clone(), HeaderValue::from(decision.remaining));
    headers.insert(RATELIMIT_RESET.clone(), HeaderValue::from(decision.reset_secs()));
}

/// The response sent in place of the handler's when a request is denied.
pub fn too_many_requests(decision: &Decision, backend: BackendKind) -> Response {
    let mut headers = HeaderMap::new();
    apply_rate_limit_headers(&mut headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.reset_secs().max(1)));
    headers.insert(
        RATELIMIT_BACKEND.clone(),
        HeaderValue::from_static(backend.as_str()),
    );

    let body = RateLimitedBody {
        success: false,
        error: "Too many requests",
        code: "rate_limited",
        limit: decision.limit,
        remaining: decision.remaining,
        reset: decision.reset_secs(),
    };

    (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
}
