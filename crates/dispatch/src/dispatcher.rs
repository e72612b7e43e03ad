//! Centralized rule-trigger dispatcher.
//!
//! Integrations call [`Dispatcher::notify_entities_changed`] on every
//! entity state change. The dispatcher dedupes and debounces the ids,
//! accumulates them into batches, rate-limits flushes, and hands accepted
//! batches to a bounded worker pool. Workers resolve the impacted rules
//! through the reverse index, snapshot just the entity states those rules
//! need, and run the engine for each rule under a per-rule KV lock.
//!
//! The notify entrypoint is non-blocking: it takes the pending-state mutex
//! briefly and never performs I/O.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use latch_core::{DispatcherConfig, EntitySource, KvStore, LatchError};
use latch_rules::engine;
use latch_rules::evaluator::EntityStateMap;
use latch_rules::executor::ActionExecutor;
use latch_rules::extractor::extract_entity_ids;
use latch_rules::repository::{DispatchRepos, EngineRepos, ScopedRepos};
use latch_rules::schema::Rule;

use crate::failure::{is_rule_allowed, record_rule_failure, record_rule_success};
use crate::index::EntityRuleIndex;
use crate::rate_limiter::TokenBucket;
use crate::stats::{DispatcherStats, StatsSnapshot};
use crate::worker::WorkerPool;

const DEBOUNCE_KEY_PREFIX: &str = "dispatcher:debounce:";
const RULE_LOCK_KEY_PREFIX: &str = "dispatcher:rule_lock:";

/// TTL of the per-rule evaluation lock. A worker holding it longer is a
/// bug; the TTL prevents permanent wedging.
const RULE_LOCK_TTL: Duration = Duration::from_secs(30);

/// A batch of entity changes accepted for dispatch.
#[derive(Debug, Clone)]
pub struct EntityChangeBatch {
    pub batch_id: String,
    pub source: EntitySource,
    pub entity_ids: BTreeSet<String>,
    pub changed_at: DateTime<Utc>,
}

impl EntityChangeBatch {
    fn new(source: EntitySource, entity_ids: BTreeSet<String>, changed_at: DateTime<Utc>) -> Self {
        let mut batch_id = Uuid::new_v4().simple().to_string();
        batch_id.truncate(8);
        Self {
            batch_id,
            source,
            entity_ids,
            changed_at,
        }
    }
}

struct PendingState {
    /// entity_id → (first_seen, source); first-seen wins on merge.
    entities: HashMap<String, (DateTime<Utc>, EntitySource)>,
    batches: VecDeque<EntityChangeBatch>,
    debounce_timer: Option<tokio::task::JoinHandle<()>>,
}

struct Inner {
    config: Mutex<DispatcherConfig>,
    pending: Mutex<PendingState>,
    stats: Arc<DispatcherStats>,
    limiter: Mutex<TokenBucket>,
    kv: Arc<dyn KvStore>,
    repos: Arc<dyn DispatchRepos>,
    index: EntityRuleIndex,
    pool: WorkerPool,
    executor: Arc<ActionExecutor>,
    shutdown: AtomicBool,
}

/// Cheaply-cloneable handle to one dispatcher instance.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Config fields surfaced on the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatus {
    pub debounce_ms: u64,
    pub batch_size_limit: usize,
    pub rate_limit_per_sec: u32,
    pub worker_concurrency: usize,
}

/// Snapshot returned by [`Dispatcher::status`].
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub enabled: bool,
    pub config: ConfigStatus,
    pub pending_entities: usize,
    pub pending_batches: usize,
    pub stats: StatsSnapshot,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        repos: Arc<dyn DispatchRepos>,
        executor: Arc<ActionExecutor>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                limiter: Mutex::new(TokenBucket::new(
                    config.rate_limit_per_sec,
                    config.rate_limit_burst,
                )),
                pool: WorkerPool::new(config.worker_concurrency),
                index: EntityRuleIndex::new(kv.clone()),
                config: Mutex::new(config),
                pending: Mutex::new(PendingState {
                    entities: HashMap::new(),
                    batches: VecDeque::new(),
                    debounce_timer: None,
                }),
                stats: Arc::new(DispatcherStats::new()),
                kv,
                repos,
                executor,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Shared statistics handle (the engine ticker records through it too).
    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.inner.stats.clone()
    }

    /// Reverse index handle for the admin write path.
    pub fn index(&self) -> &EntityRuleIndex {
        &self.inner.index
    }

    pub fn repos(&self) -> Arc<dyn DispatchRepos> {
        self.inner.repos.clone()
    }

    /// Main entrypoint for integrations to report entity changes.
    ///
    /// Thread-safe, non-blocking, idempotent within the debounce window.
    /// Must be called from within a tokio runtime (the debounce timer and
    /// workers are spawned tasks).
    pub fn notify_entities_changed(
        &self,
        source: EntitySource,
        entity_ids: &[String],
        changed_at: Option<DateTime<Utc>>,
    ) {
        if self.inner.shutdown.load(Ordering::SeqCst) || entity_ids.is_empty() {
            return;
        }

        let now = changed_at.unwrap_or_else(Utc::now);
        let (debounce_ms, batch_size_limit) = {
            let config = self.inner.config.lock().expect("config lock poisoned");
            (config.debounce_ms, config.batch_size_limit)
        };

        let mut pending = self.inner.pending.lock().expect("pending lock poisoned");

        let unique: BTreeSet<&String> = entity_ids.iter().collect();
        self.inner
            .stats
            .record_dedupe((entity_ids.len() - unique.len()) as u64);

        // Per-entity debounce: a live KV key suppresses the entity; the
        // survivors arm their keys for the next window.
        let mut suppressed = 0u64;
        let mut survivors: Vec<String> = Vec::new();
        for entity_id in unique {
            let key = format!("{DEBOUNCE_KEY_PREFIX}{entity_id}");
            if self
                .inner
                .kv
                .set_if_absent(&key, &now.to_rfc3339(), Duration::from_millis(debounce_ms))
            {
                survivors.push(entity_id.clone());
            } else {
                suppressed += 1;
            }
        }
        self.inner
            .stats
            .record_debounce(&source.to_string(), suppressed);

        if survivors.is_empty() {
            return;
        }

        for entity_id in survivors {
            pending.entities.entry(entity_id).or_insert((now, source));
        }

        if pending.entities.len() >= batch_size_limit {
            self.flush_locked(&mut pending, source, now);
        } else {
            self.schedule_flush_locked(&mut pending, debounce_ms);
        }
    }

    /// Arm the debounce timer unless one is already pending.
    fn schedule_flush_locked(&self, pending: &mut PendingState, debounce_ms: u64) {
        if pending
            .debounce_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
        {
            return;
        }
        let dispatcher = self.clone();
        pending.debounce_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
            dispatcher.debounce_fire();
        }));
    }

    /// Timer-driven flush of whatever accumulated during the window.
    fn debounce_fire(&self) {
        let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
        pending.debounce_timer = None;
        if pending.entities.is_empty() {
            return;
        }
        let sources: HashSet<EntitySource> =
            pending.entities.values().map(|(_, source)| *source).collect();
        let flush_source = if sources.len() == 1 {
            *sources.iter().next().expect("checked non-empty")
        } else {
            EntitySource::Mixed
        };
        self.flush_locked(&mut pending, flush_source, Utc::now());
    }

    /// Flush pending entities as one batch. Caller holds the pending lock.
    fn flush_locked(&self, pending: &mut PendingState, source: EntitySource, now: DateTime<Utc>) {
        if pending.entities.is_empty() {
            return;
        }

        if let Some(timer) = pending.debounce_timer.take() {
            timer.abort();
        }

        if !self
            .inner
            .limiter
            .lock()
            .expect("limiter lock poisoned")
            .acquire(1)
        {
            self.inner.stats.record_rate_limit();
            debug!("dispatcher rate limited, dropping batch");
            pending.entities.clear();
            return;
        }

        let entity_ids: BTreeSet<String> = pending.entities.keys().cloned().collect();
        let batch = EntityChangeBatch::new(source, entity_ids, now);

        let queue_max_depth = self
            .inner
            .config
            .lock()
            .expect("config lock poisoned")
            .queue_max_depth;
        if pending.batches.len() >= queue_max_depth {
            self.inner.stats.record_dropped_batch();
            warn!("dispatcher queue full, dropping oldest batch");
            pending.batches.pop_front();
        }

        pending.batches.push_back(batch.clone());
        pending.entities.clear();

        self.inner
            .stats
            .record_trigger(&source.to_string(), batch.entity_ids.len(), now);

        let dispatcher = self.clone();
        let submitted = self.inner.pool.submit(async move {
            dispatcher.dispatch_batch(batch).await;
        });
        if let Err(e) = submitted {
            warn!(error = %e, "failed to submit batch to worker pool");
        }
    }

    /// Worker-side batch processing.
    async fn dispatch_batch(&self, batch: EntityChangeBatch) {
        if let Err(e) = self.dispatch_batch_inner(&batch).await {
            error!(batch_id = %batch.batch_id, error = %e, "batch dispatch failed");
        }
        let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
        pending.batches.retain(|b| b.batch_id != batch.batch_id);
    }

    async fn dispatch_batch_inner(&self, batch: &EntityChangeBatch) -> Result<(), LatchError> {
        let repos = self.inner.repos.clone();
        let rules = self
            .inner
            .index
            .resolve_impacted_rules(&batch.entity_ids, &*repos)
            .await?;
        if rules.is_empty() {
            debug!(batch_id = %batch.batch_id, "no rules reference the changed entities");
            return Ok(());
        }

        debug!(
            batch_id = %batch.batch_id,
            rules = rules.len(),
            entities = batch.entity_ids.len(),
            source = %batch.source,
            "evaluating impacted rules"
        );

        // Snapshot only the entity states the impacted rules can read: the
        // changed ids, the persisted references, and a defensive walk of
        // each rule's tree in case the refs are stale.
        let snapshot_started = Instant::now();
        let mut required = batch.entity_ids.clone();
        let rule_ids: HashSet<i64> = rules.iter().map(|rule| rule.id).collect();
        for (entity_id, rule_id) in repos.entity_rule_refs().await? {
            if rule_ids.contains(&rule_id) {
                required.insert(entity_id);
            }
        }
        for rule in &rules {
            required.extend(extract_entity_ids(&rule.definition));
        }
        let snapshot = repos.entity_states_for(&required).await?;
        self.inner.stats.record_entity_state_snapshot(
            snapshot.len(),
            snapshot_started.elapsed().as_secs_f64() * 1000.0,
        );

        for rule in rules {
            self.evaluate_rule_with_lock(rule, &snapshot, batch).await;
        }
        Ok(())
    }

    /// Evaluate a single rule under its distributed lock.
    async fn evaluate_rule_with_lock(
        &self,
        rule: Rule,
        snapshot: &EntityStateMap,
        batch: &EntityChangeBatch,
    ) {
        let lock_key = format!("{RULE_LOCK_KEY_PREFIX}{}", rule.id);
        if !self
            .inner
            .kv
            .set_if_absent(&lock_key, &batch.batch_id, RULE_LOCK_TTL)
        {
            debug!(
                rule_id = rule.id,
                "rule locked, skipping (in-progress evaluation sees current state)"
            );
            return;
        }

        self.evaluate_rule(&rule, snapshot, batch).await;
        self.inner.kv.remove(&lock_key);
    }

    async fn evaluate_rule(&self, rule: &Rule, snapshot: &EntityStateMap, batch: &EntityChangeBatch) {
        let now = batch.changed_at;
        let repos = self.inner.repos.clone();

        let attempt: Result<Option<engine::RuleRunResult>, LatchError> = async {
            let runtime = repos.ensure_runtime(rule).await?;
            let (allowed, reason) = is_rule_allowed(&runtime, now);
            if !allowed {
                debug!(rule_id = rule.id, reason = %reason, "rule skipped");
                return Ok(None);
            }

            let scoped = ScopedRepos::new(repos.clone(), rule.clone(), snapshot.clone());
            let eval_started = Instant::now();
            let run = engine::run_rules(now, &scoped, &self.inner.executor).await?;
            self.inner
                .stats
                .record_rule_eval_time(eval_started.elapsed().as_secs_f64() * 1000.0);
            Ok(Some(run))
        }
        .await;

        match attempt {
            Ok(None) => {}
            Ok(Some(run)) => {
                self.inner.stats.record_rules_result(
                    run.evaluated,
                    run.fired,
                    run.scheduled,
                    run.errors,
                );
                // Re-fetch: the engine pass may have rewritten scheduling
                // fields on the same row.
                match repos.ensure_runtime(rule).await {
                    Ok(mut runtime) => {
                        if run.errors > 0 {
                            record_rule_failure(
                                rule,
                                &mut runtime,
                                "evaluation error (see logs)",
                                now,
                            );
                            if let Err(e) = repos.save_runtime(&runtime).await {
                                warn!(rule_id = rule.id, error = %e, "failed to persist failure state");
                            }
                        } else if record_rule_success(&mut runtime) {
                            if let Err(e) = repos.save_runtime(&runtime).await {
                                warn!(rule_id = rule.id, error = %e, "failed to persist success state");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(rule_id = rule.id, error = %e, "failed to record evaluation outcome");
                    }
                }
            }
            Err(e) => {
                error!(rule_id = rule.id, error = %e, "rule evaluation failed");
                self.inner.stats.record_rules_result(0, 0, 0, 1);
                match repos.ensure_runtime(rule).await {
                    Ok(mut runtime) => {
                        record_rule_failure(rule, &mut runtime, &e.to_string(), now);
                        if let Err(e2) = repos.save_runtime(&runtime).await {
                            warn!(rule_id = rule.id, error = %e2, "failed to persist failure state");
                        }
                    }
                    Err(e2) => {
                        warn!(rule_id = rule.id, error = %e2, "failed to record failure state");
                    }
                }
            }
        }
    }

    /// Current status and statistics.
    pub fn status(&self) -> DispatcherStatus {
        let config = *self.inner.config.lock().expect("config lock poisoned");
        let pending = self.inner.pending.lock().expect("pending lock poisoned");
        DispatcherStatus {
            enabled: true,
            config: ConfigStatus {
                debounce_ms: config.debounce_ms,
                batch_size_limit: config.batch_size_limit,
                rate_limit_per_sec: config.rate_limit_per_sec,
                worker_concurrency: config.worker_concurrency,
            },
            pending_entities: pending.entities.len(),
            pending_batches: pending.batches.len(),
            stats: self.inner.stats.snapshot(),
        }
    }

    /// Swap configuration in place; the rate limiter is rebuilt, pending
    /// state is preserved.
    pub fn reload_config(&self, config: DispatcherConfig) {
        {
            let mut limiter = self.inner.limiter.lock().expect("limiter lock poisoned");
            *limiter = TokenBucket::new(config.rate_limit_per_sec, config.rate_limit_burst);
        }
        *self.inner.config.lock().expect("config lock poisoned") = config;
        config.log_summary();
    }

    /// Graceful shutdown: refuse new notifications, cancel the debounce
    /// timer, and drain in-flight workers.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            if let Some(timer) = pending.debounce_timer.take() {
                timer.abort();
            }
        }
        self.inner.pool.shutdown().await;
    }
}
