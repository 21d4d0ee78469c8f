//! HTTP server hosting the rate limited endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::RateLimitLayer;
use crate::error::{EdgeGuardError, Result};
use crate::ratelimit::{
    login_bucket, password_reset_bucket, web_vitals_bucket, BucketConfig, BucketRegistry,
    RateLimitPolicy,
};

/// HTTP server for the protected endpoints.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The policy shared by every protected route
    policy: Arc<RateLimitPolicy>,
    /// Buckets by name
    buckets: BucketRegistry,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, policy: Arc<RateLimitPolicy>, buckets: BucketRegistry) -> Self {
        Self {
            addr,
            policy,
            buckets,
        }
    }

    /// The configured bucket named like `default`, else `default` itself.
    fn layer_for(&self, default: BucketConfig) -> RateLimitLayer {
        let bucket = self
            .buckets
            .get(&default.name)
            .cloned()
            .unwrap_or(default);
        RateLimitLayer::new(self.policy.clone(), bucket)
    }

    /// Build the router. Each protected route gets its own bucket.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route(
                "/auth/login",
                post(login).layer(self.layer_for(login_bucket())),
            )
            .route(
                "/auth/password-reset",
                post(password_reset).layer(self.layer_for(password_reset_bucket())),
            )
            .route(
                "/telemetry/web-vitals",
                post(web_vitals).layer(self.layer_for(web_vitals_bucket())),
            )
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let router = self.router();

        info!(
            addr = %self.addr,
            backend = %self.policy.backend_kind(),
            buckets = ?self.buckets.names(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                EdgeGuardError::Server(e.to_string())
            })
    }
}

// The handlers below stand in for the business endpoints; only the rate
// limiting in front of them belongs to this service.

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn login() -> Json<Value> {
    Json(json!({ "success": true, "message": "login accepted" }))
}

async fn password_reset() -> Json<Value> {
    Json(json!({ "success": true, "message": "password reset requested" }))
}

async fn web_vitals() -> Json<Value> {
    Json(json!({ "success": true }))
}
