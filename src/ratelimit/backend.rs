//! Counting backend trait for abstracting in-memory and networked stores.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a counting backend can report.
///
/// These never reach the caller of a protected endpoint: the policy evaluator
/// turns them into a fail-open or fail-closed decision.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The store could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with a non-success HTTP status.
    #[error("store returned HTTP {0}")]
    Status(u16),

    /// The reply body was not JSON.
    #[error("failed to decode store reply: {0}")]
    Decode(String),

    /// The reply was JSON but matched none of the known shapes.
    #[error("unexpected store reply: {0}")]
    UnexpectedShape(String),

    /// The store executed the batch but reported a command error.
    #[error("store command failed: {0}")]
    Command(String),
}

/// Which backend produced a decision, advertised in a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Per-process counters.
    Memory,
    /// Counters held by a remote store over its REST interface.
    Rest,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Rest => "rest",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a counter right after it was incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Requests counted in the current window, including this one.
    pub count: u64,
    /// Milliseconds until the current window expires.
    pub ttl_ms: u64,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    /// Milliseconds until the window resets; never negative.
    pub reset_ms: u64,
}

impl Decision {
    /// Decision for a counter that has reached `snapshot.count` within a window.
    pub fn from_snapshot(snapshot: CounterSnapshot, limit: u64) -> Self {
        Self {
            allowed: snapshot.count <= limit,
            remaining: limit.saturating_sub(snapshot.count),
            limit,
            reset_ms: snapshot.ttl_ms,
        }
    }

    /// Seconds until reset, rounded up.
    pub fn reset_secs(&self) -> u64 {
        self.reset_ms.div_ceil(1000)
    }
}

/// What to do when the counting backend cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Let the request through.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

impl FailMode {
    pub fn from_fail_open(fail_open: bool) -> Self {
        if fail_open {
            FailMode::Open
        } else {
            FailMode::Closed
        }
    }

    /// The decision to report when no counter value is available.
    pub fn degrade(&self, limit: u64, window_ms: u64) -> Decision {
        match self {
            FailMode::Open => Decision {
                allowed: true,
                remaining: limit.saturating_sub(1),
                limit,
                reset_ms: window_ms,
            },
            FailMode::Closed => Decision {
                allowed: false,
                remaining: 0,
                limit,
                reset_ms: window_ms,
            },
        }
    }
}

/// Trait for counting backend implementations.
///
/// A backend atomically increments the counter stored under `key`, starting a
/// new window of `window_ms` when none is running, and reports the count and
/// the time left in the window. The choice of backend is made once at startup.
#[async_trait]
pub trait CountingBackend: Send + Sync {
    /// Which kind of backend this is.
    fn kind(&self) -> BackendKind;

    /// Count one request against `key`.
    async fn hit(&self, key: &str, window_ms: u64) -> Result<CounterSnapshot, BackendError>;

    /// Count one request against `key` and decide it against `limit`.
    async fn check(&self, key: &str, limit: u64, window_ms: u64) -> Result<Decision, BackendError> {
        let snapshot = self.hit(key, window_ms).await?;
        Ok(Decision::from_snapshot(snapshot, limit))
    }
}
