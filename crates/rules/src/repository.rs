//! Repository contracts and the in-memory implementation.
//!
//! The engine and dispatcher see storage only through these traits. The
//! in-memory store backs tests and single-process deployments; a SQL-backed
//! store lives outside this workspace behind the same contracts. Methods
//! never hold a lock across an await point, so the async surface stays
//! deadlock-free even with the std sync primitives underneath.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use latch_core::{Detection, Entity, EntitySource, LatchError};

use crate::audit::{MemoryActionLog, RuleActionLog};
use crate::evaluator::{ConditionSources, EntityStateMap};
use crate::schema::{Rule, RuleRuntimeState};

// ── Engine-facing contract ──────────────────────────────────────────

/// Storage surface required by a rule-engine pass.
#[async_trait]
pub trait EngineRepos: Send + Sync {
    /// Enabled rules ordered by `priority DESC, id ASC`.
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, LatchError>;

    /// Snapshot of `entity_id → last_state` for evaluation.
    async fn entity_state_map(&self) -> Result<EntityStateMap, LatchError>;

    /// Runtimes of enabled rules with `scheduled_for <= now`, ordered by
    /// `scheduled_for ASC, rule_id ASC`, paired with their rules.
    ///
    /// SQL implementations take row locks here; the rows will be written
    /// back through [`save_runtime`](Self::save_runtime) in the same pass.
    async fn due_runtimes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Rule, RuleRuntimeState)>, LatchError>;

    /// Fetch or create the runtime row for a rule's `when` node.
    async fn ensure_runtime(&self, rule: &Rule) -> Result<RuleRuntimeState, LatchError>;

    /// Persist a runtime row.
    async fn save_runtime(&self, runtime: &RuleRuntimeState) -> Result<(), LatchError>;

    /// Append an audit row.
    async fn append_action_log(&self, entry: RuleActionLog) -> Result<(), LatchError>;

    /// Synchronous context view for the condition evaluator.
    fn sources(&self) -> &dyn ConditionSources;
}

// ── Dispatcher-facing contract ──────────────────────────────────────

/// Additional surface used by the dispatcher, reverse index, and admin API.
#[async_trait]
pub trait DispatchRepos: EngineRepos {
    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>, LatchError>;

    async fn upsert_rule(&self, rule: Rule) -> Result<(), LatchError>;

    async fn delete_rule(&self, rule_id: i64) -> Result<(), LatchError>;

    /// Every `(entity_id, rule_id)` reference pair, across all rules.
    async fn entity_rule_refs(&self) -> Result<Vec<(String, i64)>, LatchError>;

    /// Atomically replace a rule's entity references with the given set.
    async fn replace_entity_refs(
        &self,
        rule_id: i64,
        entity_ids: &BTreeSet<String>,
    ) -> Result<(), LatchError>;

    /// Enabled rules among `ids`, ordered by `priority DESC, id ASC`.
    async fn rules_by_ids(&self, ids: &HashSet<i64>) -> Result<Vec<Rule>, LatchError>;

    /// States for just the requested entity ids (missing ids are omitted).
    async fn entity_states_for(
        &self,
        entity_ids: &BTreeSet<String>,
    ) -> Result<EntityStateMap, LatchError>;

    /// All runtime rows (suspended-rules listing, diagnostics).
    async fn list_runtimes(&self) -> Result<Vec<RuleRuntimeState>, LatchError>;
}

// ── In-memory implementation ────────────────────────────────────────

/// In-memory repositories for tests and single-process deployments.
pub struct MemoryRepos {
    rules: RwLock<BTreeMap<i64, Rule>>,
    entities: RwLock<HashMap<String, Entity>>,
    runtimes: RwLock<HashMap<i64, RuleRuntimeState>>,
    entity_refs: RwLock<HashMap<i64, BTreeSet<String>>>,
    detections: RwLock<Vec<Detection>>,
    alarm_state: RwLock<Option<String>>,
    frigate_available: AtomicBool,
    action_log: MemoryActionLog,
}

impl MemoryRepos {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            entities: RwLock::new(HashMap::new()),
            runtimes: RwLock::new(HashMap::new()),
            entity_refs: RwLock::new(HashMap::new()),
            detections: RwLock::new(Vec::new()),
            alarm_state: RwLock::new(None),
            frigate_available: AtomicBool::new(false),
            action_log: MemoryActionLog::new(),
        }
    }

    /// Direct access to the audit log (status/debug surfaces).
    pub fn action_log(&self) -> &MemoryActionLog {
        &self.action_log
    }

    /// Record an entity state change, creating the entity when unknown.
    pub fn record_entity_state(
        &self,
        entity_id: &str,
        source: EntitySource,
        state: Option<String>,
        now: DateTime<Utc>,
    ) {
        let mut entities = self.entities.write().expect("entities lock poisoned");
        let entity = entities
            .entry(entity_id.to_string())
            .or_insert_with(|| Entity::new(entity_id, source));
        entity.record_state(state, now);
    }

    pub fn set_alarm_state(&self, state: Option<String>) {
        *self.alarm_state.write().expect("alarm state lock poisoned") = state;
    }

    pub fn push_detection(&self, detection: Detection) {
        self.detections
            .write()
            .expect("detections lock poisoned")
            .push(detection);
    }

    pub fn set_frigate_available(&self, available: bool) {
        self.frigate_available.store(available, Ordering::SeqCst);
    }

    fn sort_rules(mut rules: Vec<Rule>) -> Vec<Rule> {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        rules
    }
}

impl Default for MemoryRepos {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionSources for MemoryRepos {
    fn alarm_state(&self) -> Option<String> {
        self.alarm_state
            .read()
            .expect("alarm state lock poisoned")
            .clone()
    }

    fn list_detections(
        &self,
        label: &str,
        cameras: &[String],
        since: DateTime<Utc>,
    ) -> Vec<Detection> {
        let detections = self.detections.read().expect("detections lock poisoned");
        let mut matched: Vec<Detection> = detections
            .iter()
            .filter(|d| d.provider == "frigate")
            .filter(|d| d.label == label)
            .filter(|d| cameras.iter().any(|c| c == &d.camera))
            .filter(|d| d.observed_at >= since)
            .cloned()
            .collect();
        matched.sort_by_key(|d| d.observed_at);
        matched
    }

    fn detector_available(&self, _now: DateTime<Utc>) -> bool {
        self.frigate_available.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineRepos for MemoryRepos {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, LatchError> {
        let rules = self.rules.read().expect("rules lock poisoned");
        Ok(Self::sort_rules(
            rules.values().filter(|r| r.enabled).cloned().collect(),
        ))
    }

    async fn entity_state_map(&self) -> Result<EntityStateMap, LatchError> {
        let entities = self.entities.read().expect("entities lock poisoned");
        Ok(entities
            .values()
            .map(|e| (e.entity_id.clone(), e.last_state.clone()))
            .collect())
    }

    async fn due_runtimes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Rule, RuleRuntimeState)>, LatchError> {
        let rules = self.rules.read().expect("rules lock poisoned");
        let runtimes = self.runtimes.read().expect("runtimes lock poisoned");
        let mut due: Vec<(Rule, RuleRuntimeState)> = runtimes
            .values()
            .filter(|rt| rt.scheduled_for.is_some_and(|at| at <= now))
            .filter_map(|rt| {
                rules
                    .get(&rt.rule_id)
                    .filter(|rule| rule.enabled)
                    .map(|rule| (rule.clone(), rt.clone()))
            })
            .collect();
        due.sort_by(|(_, a), (_, b)| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.rule_id.cmp(&b.rule_id))
        });
        Ok(due)
    }

    async fn ensure_runtime(&self, rule: &Rule) -> Result<RuleRuntimeState, LatchError> {
        let mut runtimes = self.runtimes.write().expect("runtimes lock poisoned");
        Ok(runtimes
            .entry(rule.id)
            .or_insert_with(|| RuleRuntimeState::new(rule.id, Utc::now()))
            .clone())
    }

    async fn save_runtime(&self, runtime: &RuleRuntimeState) -> Result<(), LatchError> {
        let mut runtimes = self.runtimes.write().expect("runtimes lock poisoned");
        runtimes.insert(runtime.rule_id, runtime.clone());
        Ok(())
    }

    async fn append_action_log(&self, entry: RuleActionLog) -> Result<(), LatchError> {
        self.action_log.append(entry);
        Ok(())
    }

    fn sources(&self) -> &dyn ConditionSources {
        self
    }
}

#[async_trait]
impl DispatchRepos for MemoryRepos {
    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>, LatchError> {
        let rules = self.rules.read().expect("rules lock poisoned");
        Ok(rules.get(&rule_id).cloned())
    }

    async fn upsert_rule(&self, rule: Rule) -> Result<(), LatchError> {
        let mut rules = self.rules.write().expect("rules lock poisoned");
        rules.insert(rule.id, rule);
        Ok(())
    }

    async fn delete_rule(&self, rule_id: i64) -> Result<(), LatchError> {
        self.rules
            .write()
            .expect("rules lock poisoned")
            .remove(&rule_id);
        self.entity_refs
            .write()
            .expect("entity refs lock poisoned")
            .remove(&rule_id);
        self.runtimes
            .write()
            .expect("runtimes lock poisoned")
            .remove(&rule_id);
        Ok(())
    }

    async fn entity_rule_refs(&self) -> Result<Vec<(String, i64)>, LatchError> {
        let refs = self.entity_refs.read().expect("entity refs lock poisoned");
        let mut pairs: Vec<(String, i64)> = refs
            .iter()
            .flat_map(|(rule_id, entity_ids)| {
                entity_ids
                    .iter()
                    .map(move |entity_id| (entity_id.clone(), *rule_id))
            })
            .collect();
        pairs.sort();
        Ok(pairs)
    }

    async fn replace_entity_refs(
        &self,
        rule_id: i64,
        entity_ids: &BTreeSet<String>,
    ) -> Result<(), LatchError> {
        let mut refs = self.entity_refs.write().expect("entity refs lock poisoned");
        if entity_ids.is_empty() {
            refs.remove(&rule_id);
        } else {
            refs.insert(rule_id, entity_ids.clone());
        }
        Ok(())
    }

    async fn rules_by_ids(&self, ids: &HashSet<i64>) -> Result<Vec<Rule>, LatchError> {
        let rules = self.rules.read().expect("rules lock poisoned");
        Ok(Self::sort_rules(
            ids.iter()
                .filter_map(|id| rules.get(id))
                .filter(|rule| rule.enabled)
                .cloned()
                .collect(),
        ))
    }

    async fn entity_states_for(
        &self,
        entity_ids: &BTreeSet<String>,
    ) -> Result<EntityStateMap, LatchError> {
        let entities = self.entities.read().expect("entities lock poisoned");
        Ok(entity_ids
            .iter()
            .filter_map(|id| {
                entities
                    .get(id)
                    .map(|e| (e.entity_id.clone(), e.last_state.clone()))
            })
            .collect())
    }

    async fn list_runtimes(&self) -> Result<Vec<RuleRuntimeState>, LatchError> {
        let runtimes = self.runtimes.read().expect("runtimes lock poisoned");
        let mut all: Vec<RuleRuntimeState> = runtimes.values().cloned().collect();
        all.sort_by_key(|rt| rt.rule_id);
        Ok(all)
    }
}

// ── Single-rule view ────────────────────────────────────────────────

/// Repository view restricted to one rule and a fixed entity snapshot.
///
/// The dispatcher evaluates each impacted rule under its per-rule lock
/// through this view, so a full engine pass touches only that rule:
/// `list_enabled_rules` and `due_runtimes` see just the scoped rule, and
/// state reads come from the fixed snapshot. Runtime and audit writes flow
/// through to the real store. Other rules' due timers stay untouched; they
/// belong to whichever worker holds their lock (the periodic ticker runs
/// them with the unscoped repositories).
pub struct ScopedRepos {
    inner: std::sync::Arc<dyn DispatchRepos>,
    rule: Rule,
    snapshot: EntityStateMap,
}

impl ScopedRepos {
    pub fn new(
        inner: std::sync::Arc<dyn DispatchRepos>,
        rule: Rule,
        snapshot: EntityStateMap,
    ) -> Self {
        Self {
            inner,
            rule,
            snapshot,
        }
    }
}

#[async_trait]
impl EngineRepos for ScopedRepos {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, LatchError> {
        Ok(vec![self.rule.clone()])
    }

    async fn entity_state_map(&self) -> Result<EntityStateMap, LatchError> {
        Ok(self.snapshot.clone())
    }

    async fn due_runtimes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Rule, RuleRuntimeState)>, LatchError> {
        // Only the scoped rule's timer may fire here: the caller's lock
        // covers this rule alone, and firing another rule's due delay
        // from this view would run its actions unlocked.
        let due = self.inner.due_runtimes(now).await?;
        Ok(due
            .into_iter()
            .filter(|(rule, _)| rule.id == self.rule.id)
            .collect())
    }

    async fn ensure_runtime(&self, rule: &Rule) -> Result<RuleRuntimeState, LatchError> {
        self.inner.ensure_runtime(rule).await
    }

    async fn save_runtime(&self, runtime: &RuleRuntimeState) -> Result<(), LatchError> {
        self.inner.save_runtime(runtime).await
    }

    async fn append_action_log(&self, entry: RuleActionLog) -> Result<(), LatchError> {
        self.inner.append_action_log(entry).await
    }

    fn sources(&self) -> &dyn ConditionSources {
        self.inner.sources()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RuleDefinition, RuleKind};
    use std::sync::Arc;

    fn rule(id: i64, priority: i32, enabled: bool) -> Rule {
        Rule {
            id,
            name: format!("rule-{id}"),
            kind: RuleKind::Trigger,
            enabled,
            priority,
            cooldown_seconds: None,
            definition: RuleDefinition::default(),
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn test_list_enabled_rules_ordering() {
        let repos = MemoryRepos::new();
        repos.upsert_rule(rule(3, 5, true)).await.unwrap();
        repos.upsert_rule(rule(1, 10, true)).await.unwrap();
        repos.upsert_rule(rule(2, 10, true)).await.unwrap();
        repos.upsert_rule(rule(4, 99, false)).await.unwrap();

        let rules = repos.list_enabled_rules().await.unwrap();
        let ids: Vec<i64> = rules.iter().map(|r| r.id).collect();
        // priority DESC, id ASC; disabled rules excluded.
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_entity_state_snapshots() {
        let repos = MemoryRepos::new();
        let now = Utc::now();
        repos.record_entity_state("door", EntitySource::HomeAssistant, Some("on".into()), now);
        repos.record_entity_state("motion", EntitySource::Zigbee2mqtt, Some("off".into()), now);

        let full = repos.entity_state_map().await.unwrap();
        assert_eq!(full.len(), 2);

        let subset = repos
            .entity_states_for(&BTreeSet::from(["door".to_string(), "ghost".to_string()]))
            .await
            .unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset["door"].as_deref(), Some("on"));
    }

    #[tokio::test]
    async fn test_ensure_runtime_is_idempotent() {
        let repos = MemoryRepos::new();
        let r = rule(1, 0, true);
        repos.upsert_rule(r.clone()).await.unwrap();

        let first = repos.ensure_runtime(&r).await.unwrap();
        let mut updated = first.clone();
        updated.consecutive_failures = 3;
        repos.save_runtime(&updated).await.unwrap();

        let second = repos.ensure_runtime(&r).await.unwrap();
        assert_eq!(second.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_due_runtimes_filters_and_orders() {
        let repos = MemoryRepos::new();
        let now = Utc::now();
        for (id, offset) in [(1i64, -10i64), (2, -5), (3, 60)] {
            let r = rule(id, 0, true);
            repos.upsert_rule(r.clone()).await.unwrap();
            let mut rt = repos.ensure_runtime(&r).await.unwrap();
            rt.scheduled_for = Some(now + chrono::Duration::seconds(offset));
            repos.save_runtime(&rt).await.unwrap();
        }
        // Rule 4 is due but disabled.
        let r4 = rule(4, 0, false);
        repos.upsert_rule(r4.clone()).await.unwrap();
        let mut rt = repos.ensure_runtime(&r4).await.unwrap();
        rt.scheduled_for = Some(now - chrono::Duration::seconds(1));
        repos.save_runtime(&rt).await.unwrap();

        let due = repos.due_runtimes(now).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|(r, _)| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_entity_refs_replace_and_list() {
        let repos = MemoryRepos::new();
        repos
            .replace_entity_refs(1, &BTreeSet::from(["a".to_string(), "b".to_string()]))
            .await
            .unwrap();
        repos
            .replace_entity_refs(2, &BTreeSet::from(["b".to_string()]))
            .await
            .unwrap();

        let refs = repos.entity_rule_refs().await.unwrap();
        assert_eq!(
            refs,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 1),
                ("b".to_string(), 2)
            ]
        );

        // Replacing with a smaller set drops the stale pair.
        repos
            .replace_entity_refs(1, &BTreeSet::from(["a".to_string()]))
            .await
            .unwrap();
        let refs = repos.entity_rule_refs().await.unwrap();
        assert_eq!(refs, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_delete_rule_cleans_up() {
        let repos = MemoryRepos::new();
        let r = rule(1, 0, true);
        repos.upsert_rule(r.clone()).await.unwrap();
        repos.ensure_runtime(&r).await.unwrap();
        repos
            .replace_entity_refs(1, &BTreeSet::from(["a".to_string()]))
            .await
            .unwrap();

        repos.delete_rule(1).await.unwrap();
        assert!(repos.get_rule(1).await.unwrap().is_none());
        assert!(repos.entity_rule_refs().await.unwrap().is_empty());
        assert!(repos.list_runtimes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detection_source_filters() {
        let repos = MemoryRepos::new();
        let now = Utc::now();
        for (camera, secs_ago, label) in
            [("driveway", 10, "person"), ("porch", 5, "person"), ("driveway", 5, "cat")]
        {
            repos.push_detection(Detection {
                provider: "frigate".to_string(),
                event_id: format!("{camera}-{secs_ago}"),
                label: label.to_string(),
                camera: camera.to_string(),
                zones: Vec::new(),
                confidence_pct: 90.0,
                observed_at: now - chrono::Duration::seconds(secs_ago),
            });
        }

        let found = repos.list_detections(
            "person",
            &["driveway".to_string()],
            now - chrono::Duration::seconds(30),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].camera, "driveway");
    }

    #[tokio::test]
    async fn test_scoped_repos_restricts_rules_and_snapshot() {
        let repos = Arc::new(MemoryRepos::new());
        repos.upsert_rule(rule(1, 0, true)).await.unwrap();
        repos.upsert_rule(rule(2, 0, true)).await.unwrap();
        repos.record_entity_state(
            "door",
            EntitySource::HomeAssistant,
            Some("on".into()),
            Utc::now(),
        );

        let snapshot = EntityStateMap::from([("door".to_string(), Some("off".to_string()))]);
        let scoped = ScopedRepos::new(repos.clone(), rule(1, 0, true), snapshot);

        let rules = scoped.list_enabled_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, 1);

        // The scoped snapshot wins over the stored entity state.
        let state = scoped.entity_state_map().await.unwrap();
        assert_eq!(state["door"].as_deref(), Some("off"));

        // Runtime writes flow through to the shared store.
        let mut rt = scoped.ensure_runtime(&rules[0]).await.unwrap();
        rt.consecutive_failures = 1;
        scoped.save_runtime(&rt).await.unwrap();
        assert_eq!(
            repos.ensure_runtime(&rules[0]).await.unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_scoped_repos_filters_due_runtimes() {
        let repos = Arc::new(MemoryRepos::new());
        let now = Utc::now();
        // Two rules, both with elapsed for-delays.
        for id in [1i64, 2] {
            let r = rule(id, 0, true);
            repos.upsert_rule(r.clone()).await.unwrap();
            let mut rt = repos.ensure_runtime(&r).await.unwrap();
            rt.scheduled_for = Some(now - chrono::Duration::seconds(5));
            rt.became_true_at = Some(now - chrono::Duration::seconds(65));
            repos.save_runtime(&rt).await.unwrap();
        }
        assert_eq!(repos.due_runtimes(now).await.unwrap().len(), 2);

        // The scoped view only surfaces its own rule's due timer; the
        // other rule belongs to whichever worker holds its lock.
        let scoped = ScopedRepos::new(repos.clone(), rule(1, 0, true), EntityStateMap::new());
        let due = scoped.due_runtimes(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0.id, 1);
    }
}
