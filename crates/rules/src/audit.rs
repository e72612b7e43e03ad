//! Append-only audit log of rule action executions.
//!
//! Every successful evaluation pass writes at most one row. Rows record
//! what fired, what the actions did, the alarm-state transition, and
//! whether the firing came from an entity-change dispatch (`immediate`) or
//! an elapsed for-delay (`timer`). The in-memory store caps per-rule
//! history with FIFO eviction and supports retention pruning; a SQL-backed
//! store implements the same shape outside this workspace.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executor::ExecutionResult;
use crate::schema::{Action, RuleKind, TriggerTrace};

/// One audit row: a single firing (or failed firing) of a rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleActionLog {
    pub rule_id: i64,
    pub fired_at: DateTime<Utc>,
    pub kind: RuleKind,
    pub actions: Vec<Action>,
    /// Execution result; `None` when the pass failed before producing one.
    pub result: Option<ExecutionResult>,
    pub trace: TriggerTrace,
    pub alarm_state_before: String,
    pub alarm_state_after: String,
    /// Whole-pass error; empty on success.
    pub error: String,
}

impl RuleActionLog {
    /// Build a row from a completed execution pass.
    pub fn from_result(
        rule_id: i64,
        fired_at: DateTime<Utc>,
        kind: RuleKind,
        actions: Vec<Action>,
        result: ExecutionResult,
        trace: TriggerTrace,
    ) -> Self {
        Self {
            rule_id,
            fired_at,
            kind,
            actions,
            alarm_state_before: result.alarm_state_before.clone().unwrap_or_default(),
            alarm_state_after: result.alarm_state_after.clone().unwrap_or_default(),
            result: Some(result),
            trace,
            error: String::new(),
        }
    }

    /// Build a row for a pass that failed with no result.
    pub fn from_error(
        rule_id: i64,
        fired_at: DateTime<Utc>,
        kind: RuleKind,
        actions: Vec<Action>,
        trace: TriggerTrace,
        error: impl Into<String>,
    ) -> Self {
        Self {
            rule_id,
            fired_at,
            kind,
            actions,
            result: None,
            trace,
            alarm_state_before: String::new(),
            alarm_state_after: String::new(),
            error: error.into(),
        }
    }
}

/// Default per-rule history cap.
const DEFAULT_MAX_ENTRIES_PER_RULE: usize = 500;

/// In-memory per-rule action log with FIFO eviction.
///
/// Thread-safe via `std::sync::RwLock` so it can be read from API handlers
/// while the engine appends.
pub struct MemoryActionLog {
    entries: RwLock<HashMap<i64, VecDeque<RuleActionLog>>>,
    max_entries_per_rule: usize,
}

impl MemoryActionLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries_per_rule: DEFAULT_MAX_ENTRIES_PER_RULE,
        }
    }

    pub fn with_max_entries(max: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries_per_rule: max,
        }
    }

    /// Append a row, evicting the oldest once the per-rule cap is hit.
    pub fn append(&self, entry: RuleActionLog) {
        let mut guard = self.entries.write().expect("action log lock poisoned");
        let deque = guard.entry(entry.rule_id).or_default();
        deque.push_back(entry);
        while deque.len() > self.max_entries_per_rule {
            deque.pop_front();
        }
    }

    /// Rows for one rule, newest first, up to `limit`.
    pub fn for_rule(&self, rule_id: i64, limit: usize) -> Vec<RuleActionLog> {
        let guard = self.entries.read().expect("action log lock poisoned");
        guard
            .get(&rule_id)
            .map(|deque| deque.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Total rows across all rules.
    pub fn len(&self) -> usize {
        let guard = self.entries.read().expect("action log lock poisoned");
        guard.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop rows fired before `cutoff`, returning how many were removed.
    ///
    /// Called by the retention cleanup job.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut guard = self.entries.write().expect("action log lock poisoned");
        let mut removed = 0;
        for deque in guard.values_mut() {
            let before = deque.len();
            deque.retain(|entry| entry.fired_at >= cutoff);
            removed += before - deque.len();
        }
        guard.retain(|_, deque| !deque.is_empty());
        removed
    }
}

impl Default for MemoryActionLog {
    fn default() -> Self {
        Self::new()
    }
}
