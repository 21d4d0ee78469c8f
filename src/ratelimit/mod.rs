//! Rate limiting logic and state management.

mod backend;
mod buckets;
mod clock;
mod identity;
mod key;
mod memory;
mod policy;
mod rest;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::StoreConfig;

pub use backend::{BackendError, BackendKind, CounterSnapshot, CountingBackend, Decision, FailMode};
pub use buckets::{
    default_buckets, load_buckets, login_bucket, parse_buckets, password_reset_bucket,
    web_vitals_bucket, BucketConfig, BucketRegistry, IdentityPreference, LOGIN_BUCKET,
    PASSWORD_RESET_BUCKET, WEB_VITALS_BUCKET,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{client_address, subject_from_authorization, Identity, TokenError};
pub use key::CounterKey;
pub use memory::InMemoryCounterStore;
pub use policy::RateLimitPolicy;
pub use rest::{decode_reply, Command, HttpPipelineTransport, PipelineTransport, RestCounterStore};

/// Pick the counting backend for the life of the process.
///
/// The networked store is used when its credentials are configured; otherwise
/// counting falls back to per-process memory.
pub fn select_backend(store: &StoreConfig) -> Arc<dyn CountingBackend> {
    match store.credentials() {
        Some((url, token)) => {
            info!(url = %url, "Using networked counter store");
            Arc::new(RestCounterStore::new(url, token))
        }
        None => {
            warn!(
                "Networked counter store not configured, falling back to in-memory counters; \
                 limits are per process and not shared between instances"
            );
            Arc::new(InMemoryCounterStore::new())
        }
    }
}
