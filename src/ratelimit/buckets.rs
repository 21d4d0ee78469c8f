//! Bucket configuration.
//!
//! A bucket is a named limit (max requests per window) applied to one class of
//! endpoint. Buckets are static: they are supplied when an endpoint is wrapped
//! or loaded from configuration at startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backend::FailMode;
use crate::error::{EdgeGuardError, Result};

/// Name of the bucket protecting sign-in.
pub const LOGIN_BUCKET: &str = "login";
/// Name of the bucket protecting password reset.
pub const PASSWORD_RESET_BUCKET: &str = "password-reset";
/// Name of the bucket protecting telemetry ingestion.
pub const WEB_VITALS_BUCKET: &str = "web-vitals";

/// Which part of a request's identity a bucket counts under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityPreference {
    /// Authenticated subject, else client address.
    #[default]
    Auto,
    /// Authenticated subject only.
    User,
    /// Client address only.
    Ip,
}

/// A rate limit bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Bucket name, part of every counter key
    #[serde(alias = "bucket")]
    pub name: String,
    /// Requests allowed per window
    #[serde(alias = "max")]
    pub max_requests: u64,
    /// Window length in milliseconds
    #[serde(alias = "interval_ms", alias = "intervalMs", alias = "windowMs")]
    pub window_ms: u64,
    /// Identity the bucket counts under
    #[serde(default, alias = "identity_type", alias = "identityType")]
    pub identity: IdentityPreference,
    /// Overrides the service-wide fail policy when set
    #[serde(default, alias = "failMode")]
    pub fail_mode: Option<FailMode>,
}

impl BucketConfig {
    pub fn new(name: &str, max_requests: u64, window: Duration) -> Self {
        Self {
            name: name.to_string(),
            max_requests,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            identity: IdentityPreference::Auto,
            fail_mode: None,
        }
    }

    pub fn with_identity(mut self, identity: IdentityPreference) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = Some(fail_mode);
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Reject buckets that could never admit a request.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EdgeGuardError::Config("bucket name must not be empty".to_string()));
        }
        if self.max_requests == 0 {
            return Err(EdgeGuardError::Config(format!(
                "bucket `{}`: max_requests must be greater than zero",
                self.name
            )));
        }
        if self.window_ms == 0 {
            return Err(EdgeGuardError::Config(format!(
                "bucket `{}`: window_ms must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Default sign-in bucket: 10 per minute.
pub fn login_bucket() -> BucketConfig {
    BucketConfig::new(LOGIN_BUCKET, 10, Duration::from_secs(60))
}

/// Default password reset bucket: 5 per minute.
pub fn password_reset_bucket() -> BucketConfig {
    BucketConfig::new(PASSWORD_RESET_BUCKET, 5, Duration::from_secs(60))
}

/// Default telemetry bucket: 60 per minute per address.
pub fn web_vitals_bucket() -> BucketConfig {
    BucketConfig::new(WEB_VITALS_BUCKET, 60, Duration::from_secs(60))
        .with_identity(IdentityPreference::Ip)
}

/// Buckets applied when configuration does not override them.
pub fn default_buckets() -> Vec<BucketConfig> {
    vec![login_bucket(), password_reset_bucket(), web_vitals_bucket()]
}

#[derive(Debug, Deserialize)]
struct BucketDocument {
    #[serde(default)]
    buckets: Vec<BucketConfig>,
}

/// Parse bucket definitions from YAML.
///
/// Accepts either a bare list of buckets or a mapping with a `buckets` list.
pub fn parse_buckets(yaml: &str) -> Result<Vec<BucketConfig>> {
    match serde_yaml::from_str::<Vec<BucketConfig>>(yaml) {
        Ok(list) => Ok(list),
        Err(_) => serde_yaml::from_str::<BucketDocument>(yaml)
            .map(|doc| doc.buckets)
            .map_err(|e| EdgeGuardError::Config(format!("Failed to parse bucket config: {}", e))),
    }
}

/// Read bucket definitions from a YAML file.
pub fn load_buckets(path: &Path) -> Result<Vec<BucketConfig>> {
    let contents = std::fs::read_to_string(path)?;
    parse_buckets(&contents)
}

/// The set of buckets known to the service, by name.
#[derive(Debug, Clone, Default)]
pub struct BucketRegistry {
    buckets: HashMap<String, BucketConfig>,
}

impl BucketRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The configured buckets, plus a default for every name they leave out.
    ///
    /// Invalid or duplicate configured buckets are rejected.
    pub fn with_defaults(configured: Vec<BucketConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for bucket in configured {
            registry.insert(bucket)?;
        }
        for bucket in default_buckets() {
            registry.buckets.entry(bucket.name.clone()).or_insert(bucket);
        }
        Ok(registry)
    }

    /// Add a bucket, rejecting invalid or duplicate ones.
    pub fn insert(&mut self, bucket: BucketConfig) -> Result<()> {
        bucket.validate()?;
        if self.buckets.contains_key(&bucket.name) {
            return Err(EdgeGuardError::Config(format!(
                "bucket `{}` is defined twice",
                bucket.name
            )));
        }
        self.buckets.insert(bucket.name.clone(), bucket);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&BucketConfig> {
        self.buckets.get(name)
    }

    /// Bucket names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.buckets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
