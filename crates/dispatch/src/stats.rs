//! Observability counters for the dispatcher.
//!
//! Counters are monotonic non-decreasing except on explicit reset. A single
//! mutex guards the whole block; every record method is a short critical
//! section with no I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-source counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub triggered: u64,
    pub entities_received: u64,
    pub debounced: u64,
    pub last_dispatch_at: Option<DateTime<Utc>>,
}

/// Timing gauges for the most recent batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingStats {
    pub last_snapshot_entities: usize,
    pub last_snapshot_query_ms: f64,
    pub last_rule_eval_ms: f64,
}

/// Serializable snapshot of all dispatcher statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub triggered: u64,
    pub deduped: u64,
    pub debounced: u64,
    pub rate_limited: u64,
    pub dropped_batches: u64,
    pub rules_evaluated: u64,
    pub rules_fired: u64,
    pub rules_scheduled: u64,
    pub rules_errors: u64,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub by_source: HashMap<String, SourceStats>,
    pub timings: TimingStats,
}

/// Thread-safe dispatcher statistics.
#[derive(Default)]
pub struct DispatcherStats {
    inner: Mutex<StatsSnapshot>,
}

impl DispatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful batch flush.
    pub fn record_trigger(&self, source: &str, entity_count: usize, now: DateTime<Utc>) {
        let mut stats = self.inner.lock().expect("stats lock poisoned");
        stats.triggered += 1;
        stats.last_dispatch_at = Some(now);
        let src = stats.by_source.entry(source.to_string()).or_default();
        src.triggered += 1;
        src.entities_received += entity_count as u64;
        src.last_dispatch_at = Some(now);
    }

    /// Record entities suppressed by the per-entity debounce window.
    pub fn record_debounce(&self, source: &str, count: u64) {
        if count == 0 {
            return;
        }
        let mut stats = self.inner.lock().expect("stats lock poisoned");
        stats.debounced += count;
        stats.by_source.entry(source.to_string()).or_default().debounced += count;
    }

    /// Record duplicates removed inside a single notification.
    pub fn record_dedupe(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.inner.lock().expect("stats lock poisoned").deduped += count;
    }

    /// Record a batch dropped by the rate limiter.
    pub fn record_rate_limit(&self) {
        self.inner.lock().expect("stats lock poisoned").rate_limited += 1;
    }

    /// Record a batch dropped by queue overflow.
    pub fn record_dropped_batch(&self) {
        self.inner.lock().expect("stats lock poisoned").dropped_batches += 1;
    }

    /// Fold an engine pass result into the rule counters.
    pub fn record_rules_result(&self, evaluated: u64, fired: u64, scheduled: u64, errors: u64) {
        let mut stats = self.inner.lock().expect("stats lock poisoned");
        stats.rules_evaluated += evaluated;
        stats.rules_fired += fired;
        stats.rules_scheduled += scheduled;
        stats.rules_errors += errors;
    }

    /// Record the size and cost of an entity-state snapshot.
    pub fn record_entity_state_snapshot(&self, size: usize, query_ms: f64) {
        let mut stats = self.inner.lock().expect("stats lock poisoned");
        stats.timings.last_snapshot_entities = size;
        stats.timings.last_snapshot_query_ms = query_ms;
    }

    /// Record how long one rule evaluation took.
    pub fn record_rule_eval_time(&self, eval_ms: f64) {
        let mut stats = self.inner.lock().expect("stats lock poisoned");
        stats.timings.last_rule_eval_ms = eval_ms;
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().expect("stats lock poisoned").clone()
    }

    /// Reset all counters (for testing).
    pub fn reset(&self) {
        let mut stats = self.inner.lock().expect("stats lock poisoned");
        *stats = StatsSnapshot::default();
    }
}
