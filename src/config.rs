//! Configuration management for Edgeguard.
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML file,
//! then `EDGEGUARD__*` environment variables (`__` separates nesting, e.g.
//! `EDGEGUARD__STORE__REST_URL`). The conventional unprefixed variables
//! `UPSTASH_REDIS_REST_URL`, `UPSTASH_REDIS_REST_TOKEN`, `RATE_LIMIT_DEBUG`
//! and `RATE_LIMIT_FAIL_OPEN` fill in whatever the prefixed ones leave unset.
//!
//! Buckets may also live in a separate YAML file named by `buckets_path`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EdgeGuardError, Result};
use crate::ratelimit::{load_buckets, BucketConfig, BucketRegistry};

const ENV_PREFIX: &str = "EDGEGUARD";

/// Main configuration for the Edgeguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Networked counter store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Buckets overriding or adding to the defaults
    #[serde(default)]
    pub buckets: Vec<BucketConfig>,

    /// Optional YAML file with more buckets
    #[serde(default)]
    pub buckets_path: Option<PathBuf>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Connection parameters for the networked counter store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the store's REST interface
    #[serde(default)]
    pub rest_url: Option<String>,

    /// Bearer token for the REST interface
    #[serde(default)]
    pub rest_token: Option<String>,
}

impl StoreConfig {
    /// URL and token, if both are present and non-blank.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let url = self.rest_url.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let token = self.rest_token.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some((url, token))
    }
}

/// Limiter behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Prefix for every counter key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Log every decision and backend failure at info/warn
    #[serde(default)]
    pub debug: bool,

    /// Allow requests through when the counting backend fails
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            debug: false,
            fail_open: default_fail_open(),
        }
    }
}

fn default_namespace() -> String {
    "rl".to_string()
}

fn default_fail_open() -> bool {
    true
}

impl ServiceConfig {
    /// Load configuration from the optional file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EdgeGuardError::Config(e.to_string()))?;

        config.apply_conventional_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Fill unset values from the unprefixed variables.
    ///
    /// `lookup` stands in for `std::env::var` so this can be exercised without
    /// touching the process environment.
    pub fn apply_conventional_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefixed = |section: &str, field: &str| {
            lookup(&format!("{}__{}__{}", ENV_PREFIX, section, field).to_uppercase()).is_some()
        };

        if self.store.rest_url.is_none() {
            self.store.rest_url = lookup("UPSTASH_REDIS_REST_URL");
        }
        if self.store.rest_token.is_none() {
            self.store.rest_token = lookup("UPSTASH_REDIS_REST_TOKEN");
        }
        if !prefixed("limiter", "debug") {
            if let Some(debug) = lookup("RATE_LIMIT_DEBUG").as_deref().and_then(parse_flag) {
                self.limiter.debug = debug;
            }
        }
        if !prefixed("limiter", "fail_open") {
            if let Some(fail_open) = lookup("RATE_LIMIT_FAIL_OPEN").as_deref().and_then(parse_flag) {
                self.limiter.fail_open = fail_open;
            }
        }
    }

    /// Check the limiter settings. Buckets are checked by [`Self::bucket_registry`].
    pub fn validate(&self) -> Result<()> {
        if self.limiter.namespace.trim().is_empty() {
            return Err(EdgeGuardError::Config("limiter namespace must not be empty".to_string()));
        }
        Ok(())
    }

    /// Build the bucket registry from inline buckets, the buckets file and
    /// the defaults. A name defined twice across both sources is an error.
    pub fn bucket_registry(&self) -> Result<BucketRegistry> {
        let mut configured = self.buckets.clone();
        if let Some(path) = self.buckets_path.as_deref() {
            configured.extend(load_buckets(path)?);
        }
        BucketRegistry::with_defaults(configured)
    }
}

/// Parse a boolean-ish environment value.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
