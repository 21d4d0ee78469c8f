//! Tower middleware that puts a rate limit bucket in front of a handler.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use tower::{Layer, Service};

use super::response::{apply_rate_limit_headers, too_many_requests};
use crate::ratelimit::{BucketConfig, RateLimitPolicy};

/// A layer that enforces one bucket using a [`RateLimitPolicy`].
#[derive(Clone)]
pub struct RateLimitLayer {
    policy: Arc<RateLimitPolicy>,
    bucket: Arc<BucketConfig>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(policy: Arc<RateLimitPolicy>, bucket: BucketConfig) -> Self {
        Self {
            policy,
            bucket: Arc::new(bucket),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            policy: self.policy.clone(),
            bucket: self.bucket.clone(),
        }
    }
}

/// Middleware service that enforces a bucket.
///
/// Denied requests get a 429 and never reach the inner service. Allowed
/// requests are forwarded and their response carries the quota headers. The
/// service adds no errors of its own.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    policy: Arc<RateLimitPolicy>,
    bucket: Arc<BucketConfig>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let policy = self.policy.clone();
        let bucket = self.bucket.clone();

        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (decision, _identity) = policy.evaluate(request.headers(), &bucket).await;

            if !decision.allowed {
                return Ok(too_many_requests(&decision, policy.backend_kind()));
            }

            let mut response = inner.call(request).await?;
            apply_rate_limit_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}
