//! Counter key generation.

use std::fmt;

/// A key that uniquely identifies a counter in the backing store.
///
/// Rendered as `<namespace>:<bucket>:<identity>`, e.g. `rl:login:ip:203.0.113.7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Prefix shared by every key this service writes
    pub namespace: String,
    /// Bucket name
    pub bucket: String,
    /// Identity component selected by the bucket's preference
    pub identity: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(namespace: &str, bucket: &str, identity: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            bucket: bucket.to_string(),
            identity: identity.to_string(),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.bucket, self.identity)
    }
}
