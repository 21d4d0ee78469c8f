//! In-process counting backend.
//!
//! Used when no networked store is configured. Counters live for the lifetime
//! of the process and are not shared between instances, so a horizontally
//! scaled deployment effectively multiplies every limit by its instance count.
//! Keys are never evicted on their own either: each distinct identity seen
//! keeps an entry until [`InMemoryCounterStore::purge_expired`] is called.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::backend::{BackendError, BackendKind, CounterSnapshot, CountingBackend};
use super::clock::{Clock, SystemClock};

/// A single fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CounterRecord {
    count: u64,
    reset_at_ms: u64,
}

/// Counting backend that keeps fixed-window counters in a concurrent map.
///
/// The store is an ordinary value owned by whoever builds it, so tests and
/// the composition root each get their own set of counters.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, CounterRecord>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    /// Create an empty store on the monotonic system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Current count for a key, if its window is still running.
    pub fn get_count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        self.counters
            .get(key)
            .filter(|record| now < record.reset_at_ms)
            .map(|record| record.count)
    }

    /// Number of keys held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every counter whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters.retain(|_, record| now < record.reset_at_ms);
        before.saturating_sub(self.counters.len())
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CountingBackend for InMemoryCounterStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn hit(&self, key: &str, window_ms: u64) -> Result<CounterSnapshot, BackendError> {
        let now = self.clock.now_millis();

        // The entry guard holds the shard lock, so the read-modify-write below
        // is atomic per key.
        let mut record = self.counters.entry(key.to_string()).or_insert(CounterRecord {
            count: 0,
            reset_at_ms: 0,
        });

        // A deadline further out than one window means the clock moved
        // backward; the old window cannot be trusted.
        let stale = record.reset_at_ms.saturating_sub(now) > window_ms;

        if record.count == 0 || now >= record.reset_at_ms || stale {
            trace!(key = %key, window_ms = window_ms, "Starting new window");
            record.count = 1;
            record.reset_at_ms = now.saturating_add(window_ms);
        } else {
            record.count += 1;
        }

        Ok(CounterSnapshot {
            count: record.count,
            ttl_ms: record.reset_at_ms.saturating_sub(now),
        })
    }
}
