//! Policy evaluation: identity + bucket + backend -> decision.

use std::sync::Arc;

use axum::http::HeaderMap;
use tracing::{debug, info, instrument, trace, warn};

use super::backend::{BackendKind, CountingBackend, Decision, FailMode};
use super::buckets::BucketConfig;
use super::identity::Identity;
use super::key::CounterKey;
use crate::config::LimiterConfig;

/// Evaluates requests against buckets using a single counting backend.
///
/// Callers must evaluate each request once: every evaluation counts.
pub struct RateLimitPolicy {
    backend: Arc<dyn CountingBackend>,
    namespace: String,
    default_fail_mode: FailMode,
    verbose: bool,
}

impl RateLimitPolicy {
    /// Create a policy over `backend` with the limiter settings.
    pub fn new(backend: Arc<dyn CountingBackend>, config: &LimiterConfig) -> Self {
        Self {
            backend,
            namespace: config.namespace.clone(),
            default_fail_mode: FailMode::from_fail_open(config.fail_open),
            verbose: config.debug,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The counter key a request with this identity is counted under.
    pub fn counter_key(&self, identity: &Identity, bucket: &BucketConfig) -> CounterKey {
        CounterKey::new(&self.namespace, &bucket.name, identity.key_for(bucket.identity))
    }

    /// Count a request against `bucket` and decide whether it may proceed.
    ///
    /// Never fails: a backend error yields the bucket's fail-policy decision.
    #[instrument(skip(self, headers, bucket), fields(bucket = %bucket.name))]
    pub async fn evaluate(&self, headers: &HeaderMap, bucket: &BucketConfig) -> (Decision, Identity) {
        let identity = Identity::resolve(headers);
        let key = self.counter_key(&identity, bucket).to_string();

        let decision = match self
            .backend
            .check(&key, bucket.max_requests, bucket.window_ms)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                let fail_mode = bucket.fail_mode.unwrap_or(self.default_fail_mode);
                if self.verbose {
                    warn!(
                        key = %key,
                        backend = %self.backend.kind(),
                        fail_mode = ?fail_mode,
                        error = %e,
                        "Counting backend failed, applying fail policy"
                    );
                } else {
                    debug!(key = %key, error = %e, "Counting backend failed");
                }
                fail_mode.degrade(bucket.max_requests, bucket.window_ms)
            }
        };

        if self.verbose {
            info!(
                key = %key,
                allowed = decision.allowed,
                remaining = decision.remaining,
                reset_ms = decision.reset_ms,
                "Rate limit decision made"
            );
        } else {
            trace!(key = %key, allowed = decision.allowed, "Rate limit decision made");
        }

        (decision, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::{BackendError, CounterSnapshot};
    use crate::ratelimit::buckets::IdentityPreference;
    use crate::ratelimit::memory::InMemoryCounterStore;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    struct UnreachableBackend;

    #[async_trait]
    impl CountingBackend for UnreachableBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Rest
        }

        async fn hit(&self, _key: &str, _window_ms: u64) -> Result<CounterSnapshot, BackendError> {
            Err(BackendError::Status(503))
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Evaluate once against a failing backend, returning what was logged at info and above.
    async fn logged_failure(debug: bool) -> (Decision, String) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let policy = RateLimitPolicy::new(
            Arc::new(UnreachableBackend),
            &LimiterConfig {
                debug,
                ..LimiterConfig::default()
            },
        );
        let bucket = BucketConfig::new("login", 3, Duration::from_secs(30));
        let (decision, _) = policy.evaluate(&HeaderMap::new(), &bucket).await;

        (decision, logs.contents())
    }

    fn limiter_config(fail_open: bool) -> LimiterConfig {
        LimiterConfig {
            fail_open,
            ..LimiterConfig::default()
        }
    }

    fn memory_policy() -> (RateLimitPolicy, Arc<InMemoryCounterStore>) {
        let store = Arc::new(InMemoryCounterStore::new());
        let policy = RateLimitPolicy::new(store.clone(), &limiter_config(true));
        (policy, store)
    }

    fn bearer(subject: &str) -> HeaderValue {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}"}}"#, subject));
        HeaderValue::from_str(&format!("Bearer eyJhbGciOiJIUzI1NiJ9.{}.sig", payload)).unwrap()
    }

    #[tokio::test]
    async fn test_keys_follow_identity_preference() {
        let (policy, store) = memory_policy();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", bearer("abc"));
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.1"));

        let auto = BucketConfig::new("auto", 5, Duration::from_secs(60));
        let user = BucketConfig::new("user", 5, Duration::from_secs(60))
            .with_identity(IdentityPreference::User);
        let ip = BucketConfig::new("ip", 5, Duration::from_secs(60))
            .with_identity(IdentityPreference::Ip);

        for bucket in [&auto, &user, &ip] {
            policy.evaluate(&headers, bucket).await;
        }

        assert_eq!(store.get_count("rl:auto:user:abc"), Some(1));
        assert_eq!(store.get_count("rl:user:abc"), Some(1));
        assert_eq!(store.get_count("rl:ip:192.0.2.1"), Some(1));
    }

    #[tokio::test]
    async fn test_user_preference_does_not_fall_back_to_address() {
        let (policy, store) = memory_policy();
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.1"));

        let bucket = BucketConfig::new("reset", 5, Duration::from_secs(60))
            .with_identity(IdentityPreference::User);
        let (_, identity) = policy.evaluate(&headers, &bucket).await;

        assert_eq!(identity.composite_key, "ip:192.0.2.1");
        assert_eq!(store.get_count("rl:reset:unknown"), Some(1));
    }

    #[tokio::test]
    async fn test_evaluate_counts_down_then_denies() {
        let (policy, _store) = memory_policy();
        let headers = HeaderMap::new();
        let bucket = BucketConfig::new("login", 2, Duration::from_secs(60));

        let (first, identity) = policy.evaluate(&headers, &bucket).await;
        assert_eq!(identity.composite_key, "ip:unknown");
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let (second, _) = policy.evaluate(&headers, &bucket).await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let (third, _) = policy.evaluate(&headers, &bucket).await;
        assert!(!third.allowed);
        assert_eq!(third.limit, 2);
        assert!(third.reset_ms <= 60_000);
    }

    #[tokio::test]
    async fn test_fail_open_allows_every_call() {
        let policy = RateLimitPolicy::new(Arc::new(UnreachableBackend), &limiter_config(true));
        let bucket = BucketConfig::new("login", 1, Duration::from_secs(30));

        for _ in 0..5 {
            let (decision, _) = policy.evaluate(&HeaderMap::new(), &bucket).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 0);
            assert_eq!(decision.reset_ms, 30_000);
        }
    }

    #[tokio::test]
    async fn test_fail_closed_denies_every_call() {
        let policy = RateLimitPolicy::new(Arc::new(UnreachableBackend), &limiter_config(false));
        let bucket = BucketConfig::new("login", 10, Duration::from_secs(30));

        for _ in 0..5 {
            let (decision, _) = policy.evaluate(&HeaderMap::new(), &bucket).await;
            assert!(!decision.allowed);
            assert_eq!(decision.remaining, 0);
            assert_eq!(decision.reset_ms, 30_000);
        }
    }

    #[tokio::test]
    async fn test_bucket_fail_mode_overrides_default() {
        let policy = RateLimitPolicy::new(Arc::new(UnreachableBackend), &limiter_config(true));
        let bucket = BucketConfig::new("login", 10, Duration::from_secs(30))
            .with_fail_mode(FailMode::Closed);

        let (decision, _) = policy.evaluate(&HeaderMap::new(), &bucket).await;
        assert!(!decision.allowed);
        assert_eq!(policy.backend_kind(), BackendKind::Rest);
    }

    #[tokio::test]
    async fn test_debug_flag_raises_failure_and_decision_logs() {
        let (decision, logs) = logged_failure(true).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("Counting backend failed, applying fail policy"));
        assert!(logs.contains("503"));
        assert!(logs.contains("INFO"));
        assert!(logs.contains("Rate limit decision made"));
        assert!(logs.contains("rl:login:ip:unknown"));

        let (decision, logs) = logged_failure(false).await;
        assert!(decision.allowed);
        assert!(!logs.contains("Counting backend failed"));
        assert!(!logs.contains("Rate limit decision made"));
    }
}
