//! Entity→rules reverse index.
//!
//! Avoids scanning every rule on each notification: a cached map from
//! entity id to the set of rule ids referencing it. The cache rebuilds when
//! its TTL expires or when the shared version token (bumped on every rule
//! write) no longer matches; the token is what keeps multiple dispatcher
//! processes coherent through a shared KV store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use latch_core::{KvStore, LatchError};
use latch_rules::repository::DispatchRepos;
use latch_rules::schema::Rule;

/// Shared KV key holding the cache-wide version token.
const VERSION_KEY: &str = "dispatcher:entity_rule_cache_version";

/// Default refresh interval.
pub const DEFAULT_INDEX_TTL: Duration = Duration::from_secs(60);

struct IndexState {
    map: HashMap<String, HashSet<i64>>,
    refreshed_at: Option<Instant>,
    version: Option<String>,
}

/// Cached `entity_id → rule ids` mapping with TTL + version invalidation.
///
/// Readers and the rebuilder share one async mutex, so a rebuild is atomic
/// from the reader's perspective.
pub struct EntityRuleIndex {
    state: Mutex<IndexState>,
    ttl: Duration,
    kv: Arc<dyn KvStore>,
}

impl EntityRuleIndex {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_ttl(kv, DEFAULT_INDEX_TTL)
    }

    pub fn with_ttl(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(IndexState {
                map: HashMap::new(),
                refreshed_at: None,
                version: None,
            }),
            ttl,
            kv,
        }
    }

    /// Rule ids referencing any of the given entities, refreshing the cache
    /// first when it is stale.
    pub async fn rule_ids_for(
        &self,
        entity_ids: &BTreeSet<String>,
        repos: &dyn DispatchRepos,
    ) -> Result<HashSet<i64>, LatchError> {
        let mut state = self.state.lock().await;

        let shared_version = self.get_or_init_shared_version();
        let ttl_expired = state
            .refreshed_at
            .is_none_or(|at| at.elapsed() > self.ttl);
        if state.version.as_deref() != Some(shared_version.as_str()) || ttl_expired {
            let refs = repos.entity_rule_refs().await?;
            let mut map: HashMap<String, HashSet<i64>> = HashMap::new();
            for (entity_id, rule_id) in refs {
                map.entry(entity_id).or_default().insert(rule_id);
            }
            debug!(entities = map.len(), "refreshed entity-rule cache");
            state.map = map;
            state.refreshed_at = Some(Instant::now());
            state.version = Some(shared_version);
        }

        let mut rule_ids = HashSet::new();
        for entity_id in entity_ids {
            if let Some(ids) = state.map.get(entity_id) {
                rule_ids.extend(ids.iter().copied());
            }
        }
        Ok(rule_ids)
    }

    /// Resolve the enabled rules impacted by the given entities, ordered by
    /// `priority DESC, id ASC`.
    pub async fn resolve_impacted_rules(
        &self,
        entity_ids: &BTreeSet<String>,
        repos: &dyn DispatchRepos,
    ) -> Result<Vec<Rule>, LatchError> {
        let rule_ids = self.rule_ids_for(entity_ids, repos).await?;
        if rule_ids.is_empty() {
            return Ok(Vec::new());
        }
        repos.rules_by_ids(&rule_ids).await
    }

    /// Invalidate the cache and bump the shared version token.
    ///
    /// Call after any rule create/update/delete so every dispatcher process
    /// rebuilds on its next lookup.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.refreshed_at = None;
        state.version = None;
        self.kv
            .set_with_ttl(VERSION_KEY, &Uuid::new_v4().simple().to_string(), None);
        debug!("entity-rule cache invalidated");
    }

    fn get_or_init_shared_version(&self) -> String {
        match self.kv.get(VERSION_KEY) {
            Some(version) if !version.trim().is_empty() => version.trim().to_string(),
            _ => {
                let version = Uuid::new_v4().simple().to_string();
                self.kv.set_with_ttl(VERSION_KEY, &version, None);
                version
            }
        }
    }
}

/// Resolve impacted rules straight from the repositories, bypassing the
/// cache.
///
/// Defensive fallback for diagnostics and tests; the dispatch hot path
/// always goes through [`EntityRuleIndex`].
pub async fn resolve_impacted_rules_uncached(
    entity_ids: &BTreeSet<String>,
    repos: &dyn DispatchRepos,
) -> Result<Vec<Rule>, LatchError> {
    let refs = repos.entity_rule_refs().await?;
    let rule_ids: HashSet<i64> = refs
        .into_iter()
        .filter(|(entity_id, _)| entity_ids.contains(entity_id))
        .map(|(_, rule_id)| rule_id)
        .collect();
    if rule_ids.is_empty() {
        return Ok(Vec::new());
    }
    repos.rules_by_ids(&rule_ids).await
}
