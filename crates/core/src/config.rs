//! Dispatcher configuration and settings normalization.
//!
//! Configuration arrives either as a raw JSON settings blob (the admin API
//! stores per-deployment overrides) or from environment variables for the
//! demo binary. Out-of-range values are clamped, never rejected: the
//! dispatcher is always enabled and always has a usable config.

use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Dispatcher config ─────────────────────────────────────────

/// Configuration for the rule trigger dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Per-entity quiet window in milliseconds (50–2000).
    pub debounce_ms: u64,
    /// Pending-entity count that forces an immediate flush (1–1000).
    pub batch_size_limit: usize,
    /// Sustained flush rate in batches per second (≥1).
    pub rate_limit_per_sec: u32,
    /// Burst capacity of the flush rate limiter (≥1).
    pub rate_limit_burst: u32,
    /// Concurrent batch-evaluation slots (1–16).
    pub worker_concurrency: usize,
    /// Maximum accepted batches awaiting a worker (≥10).
    pub queue_max_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            batch_size_limit: 100,
            rate_limit_per_sec: 10,
            rate_limit_burst: 50,
            worker_concurrency: 4,
            queue_max_depth: 1000,
        }
    }
}

impl DispatcherConfig {
    /// Normalize a raw settings value into a valid config.
    ///
    /// Missing or non-object input yields the defaults; individual fields
    /// outside their documented range are clamped to the nearest bound.
    pub fn from_value(raw: Option<&serde_json::Value>) -> Self {
        let defaults = Self::default();
        let Some(obj) = raw.and_then(|v| v.as_object()) else {
            return defaults;
        };

        let get = |key: &str, default: i64| -> i64 {
            obj.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
        };

        Self {
            debounce_ms: get("debounce_ms", defaults.debounce_ms as i64).clamp(50, 2000) as u64,
            batch_size_limit: get("batch_size_limit", defaults.batch_size_limit as i64)
                .clamp(1, 1000) as usize,
            rate_limit_per_sec: get("rate_limit_per_sec", defaults.rate_limit_per_sec as i64)
                .max(1) as u32,
            rate_limit_burst: get("rate_limit_burst", defaults.rate_limit_burst as i64).max(1)
                as u32,
            worker_concurrency: get("worker_concurrency", defaults.worker_concurrency as i64)
                .clamp(1, 16) as usize,
            queue_max_depth: get("queue_max_depth", defaults.queue_max_depth as i64).max(10)
                as usize,
        }
    }

    /// Build config from `LATCH_*` environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let raw = serde_json::json!({
            "debounce_ms": env_i64("LATCH_DEBOUNCE_MS", defaults.debounce_ms as i64),
            "batch_size_limit": env_i64("LATCH_BATCH_SIZE_LIMIT", defaults.batch_size_limit as i64),
            "rate_limit_per_sec": env_i64("LATCH_RATE_LIMIT_PER_SEC", defaults.rate_limit_per_sec as i64),
            "rate_limit_burst": env_i64("LATCH_RATE_LIMIT_BURST", defaults.rate_limit_burst as i64),
            "worker_concurrency": env_i64("LATCH_WORKER_CONCURRENCY", defaults.worker_concurrency as i64),
            "queue_max_depth": env_i64("LATCH_QUEUE_MAX_DEPTH", defaults.queue_max_depth as i64),
        });
        Self::from_value(Some(&raw))
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!(
            debounce_ms = self.debounce_ms,
            batch_size_limit = self.batch_size_limit,
            rate_limit_per_sec = self.rate_limit_per_sec,
            rate_limit_burst = self.rate_limit_burst,
            worker_concurrency = self.worker_concurrency,
            queue_max_depth = self.queue_max_depth,
            "dispatcher config loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_when_missing() {
        assert_eq!(DispatcherConfig::from_value(None), DispatcherConfig::default());
        assert_eq!(
            DispatcherConfig::from_value(Some(&json!("not an object"))),
            DispatcherConfig::default()
        );
    }

    #[test]
    fn test_values_pass_through_in_range() {
        let cfg = DispatcherConfig::from_value(Some(&json!({
            "debounce_ms": 500,
            "batch_size_limit": 10,
            "rate_limit_per_sec": 2,
            "rate_limit_burst": 5,
            "worker_concurrency": 8,
            "queue_max_depth": 50,
        })));
        assert_eq!(cfg.debounce_ms, 500);
        assert_eq!(cfg.batch_size_limit, 10);
        assert_eq!(cfg.rate_limit_per_sec, 2);
        assert_eq!(cfg.rate_limit_burst, 5);
        assert_eq!(cfg.worker_concurrency, 8);
        assert_eq!(cfg.queue_max_depth, 50);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let cfg = DispatcherConfig::from_value(Some(&json!({
            "debounce_ms": 10,
            "batch_size_limit": 100_000,
            "rate_limit_per_sec": 0,
            "rate_limit_burst": -3,
            "worker_concurrency": 64,
            "queue_max_depth": 2,
        })));
        assert_eq!(cfg.debounce_ms, 50);
        assert_eq!(cfg.batch_size_limit, 1000);
        assert_eq!(cfg.rate_limit_per_sec, 1);
        assert_eq!(cfg.rate_limit_burst, 1);
        assert_eq!(cfg.worker_concurrency, 16);
        assert_eq!(cfg.queue_max_depth, 10);
    }

    #[test]
    fn test_non_integer_fields_fall_back_to_defaults() {
        let cfg = DispatcherConfig::from_value(Some(&json!({
            "debounce_ms": "fast",
            "worker_concurrency": 2,
        })));
        assert_eq!(cfg.debounce_ms, 200);
        assert_eq!(cfg.worker_concurrency, 2);
    }
}
