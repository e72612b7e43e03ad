//! Pluggable TTL key-value store for cross-worker coordination.
//!
//! The dispatcher uses this for per-entity debounce keys, per-rule
//! evaluation locks, and the reverse-index version token. The in-memory
//! default is sufficient for single-process deployments; a shared store
//! (Redis-equivalent) behind the same trait is required when multiple
//! processes dispatch against the same rule set.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimal TTL key-value contract.
///
/// All operations are infallible from the caller's perspective: a backend
/// that loses connectivity should degrade (treat keys as absent) rather
/// than surface errors into the dispatch hot path.
pub trait KvStore: Send + Sync {
    /// Store `value` under `key` only if the key is absent (or expired).
    ///
    /// Returns `true` when the value was stored. This is the atomic
    /// primitive behind per-rule locks and debounce suppression.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool;

    /// Store `value` under `key`, replacing any existing value.
    /// `ttl = None` means the key never expires.
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Option<Duration>);

    /// Fetch the live value under `key`, if any.
    fn get(&self, key: &str) -> Option<String>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str);
}

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory [`KvStore`] with lazy expiry.
///
/// Expired entries are dropped when touched; there is no background
/// sweeper. Keyspaces here are small (one key per pending entity plus one
/// per in-flight rule), so lazy cleanup is enough.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        if let Some(existing) = entries.get(key) {
            if !existing.is_expired(now) {
                return false;
            }
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        true
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_if_absent_blocks_second_writer() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("lock", "a", Duration::from_secs(30)));
        assert!(!kv.set_if_absent("lock", "b", Duration::from_secs(30)));
        assert_eq!(kv.get("lock").as_deref(), Some("a"));
    }

    #[test]
    fn test_set_if_absent_succeeds_after_expiry() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("lock", "a", Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(kv.set_if_absent("lock", "b", Duration::from_secs(30)));
        assert_eq!(kv.get("lock").as_deref(), Some("b"));
    }

    #[test]
    fn test_get_drops_expired_entries() {
        let kv = MemoryKv::new();
        kv.set_with_ttl("k", "v", Some(Duration::from_millis(10)));
        assert_eq!(kv.get("k").as_deref(), Some("v"));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(kv.get("k"), None);
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let kv = MemoryKv::new();
        kv.set_with_ttl("version", "abc", None);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(kv.get("version").as_deref(), Some("abc"));
    }

    #[test]
    fn test_remove_then_set_if_absent() {
        let kv = MemoryKv::new();
        kv.set_with_ttl("k", "v", None);
        kv.remove("k");
        assert!(kv.set_if_absent("k", "w", Duration::from_secs(1)));
    }
}
