//! Rule-engine orchestration: the two-pass evaluation loop.
//!
//! Pass 1 fires rules whose `for`-delay has elapsed (due runtimes); pass 2
//! evaluates every enabled rule immediately, scheduling `for`-delayed rules
//! instead of firing them. Both passes run inside the caller's unit of
//! work: the dispatcher invokes this with a single-rule scoped view under a
//! per-rule lock, the periodic ticker with the full repositories.
//!
//! Per-rule action failures are contained: the pass writes an audit row
//! with the error and keeps going. Repository failures abort the pass.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use latch_core::LatchError;

use crate::audit::RuleActionLog;
use crate::evaluator::{
    eval_condition_explain_with_context, eval_condition_with_context, ConditionSources,
    ConditionTrace, EntityStateMap,
};
use crate::executor::ActionExecutor;
use crate::repository::EngineRepos;
use crate::runtime::cooldown_active;
use crate::schema::{extract_for, Action, RuleKind, TriggerSource, TriggerTrace};

/// Summary counters for one engine pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleRunResult {
    pub evaluated: u64,
    pub fired: u64,
    pub scheduled: u64,
    pub skipped_cooldown: u64,
    pub errors: u64,
}

/// Evaluate enabled rules and execute or schedule their actions.
pub async fn run_rules<R>(
    now: DateTime<Utc>,
    repos: &R,
    executor: &ActionExecutor,
) -> Result<RuleRunResult, LatchError>
where
    R: EngineRepos + ?Sized,
{
    let rules = repos.list_enabled_rules().await?;
    let entity_state = repos.entity_state_map().await?;

    let mut result = RuleRunResult {
        evaluated: rules.len() as u64,
        ..Default::default()
    };

    // Pass 1: rules whose for-delay has elapsed.
    for (rule, mut runtime) in repos.due_runtimes(now).await? {
        let (seconds, child) = extract_for(rule.definition.when.as_ref());
        let Some(_seconds) = seconds else {
            // The when tree lost its root `for` since scheduling; drop the
            // stale schedule.
            runtime.scheduled_for = None;
            runtime.became_true_at = None;
            runtime.updated_at = now;
            repos.save_runtime(&runtime).await?;
            continue;
        };

        let matched = child.is_some_and(|child| {
            eval_condition_with_context(child, &entity_state, now, repos.sources())
        });
        if !matched {
            runtime.scheduled_for = None;
            runtime.became_true_at = None;
            runtime.updated_at = now;
            repos.save_runtime(&runtime).await?;
            continue;
        }

        if cooldown_active(&rule, &runtime, now) {
            result.skipped_cooldown += 1;
            runtime.scheduled_for = None;
            runtime.updated_at = now;
            repos.save_runtime(&runtime).await?;
            continue;
        }

        let actions = rule.definition.then.clone();
        match executor.execute(&rule, &actions, now).await {
            Ok(outcome) => {
                // Gateway failures inside the pass count as errors so the
                // caller's circuit breaker sees them.
                if !outcome.errors.is_empty() {
                    result.errors += 1;
                }
                repos
                    .append_action_log(RuleActionLog::from_result(
                        rule.id,
                        now,
                        rule.kind,
                        actions,
                        outcome,
                        TriggerTrace {
                            source: TriggerSource::Timer,
                        },
                    ))
                    .await?;
                runtime.last_fired_at = Some(now);
                runtime.scheduled_for = None;
                runtime.updated_at = now;
                repos.save_runtime(&runtime).await?;
                result.fired += 1;
                debug!(rule_id = rule.id, "for-delay elapsed, rule fired");
            }
            Err(e) => {
                result.errors += 1;
                warn!(rule_id = rule.id, error = %e, "timer-pass action execution failed");
                repos
                    .append_action_log(RuleActionLog::from_error(
                        rule.id,
                        now,
                        rule.kind,
                        Vec::new(),
                        TriggerTrace {
                            source: TriggerSource::Timer,
                        },
                        e.to_string(),
                    ))
                    .await?;
            }
        }
    }

    // Pass 2: immediate evaluation of every enabled rule.
    for rule in &rules {
        let (seconds, child) = extract_for(rule.definition.when.as_ref());

        if let Some(seconds) = seconds {
            let mut runtime = repos.ensure_runtime(rule).await?;
            let matched = child.is_some_and(|child| {
                eval_condition_with_context(child, &entity_state, now, repos.sources())
            });
            if !matched {
                if runtime.became_true_at.is_some() || runtime.scheduled_for.is_some() {
                    runtime.became_true_at = None;
                    runtime.scheduled_for = None;
                    runtime.updated_at = now;
                    repos.save_runtime(&runtime).await?;
                }
                continue;
            }
            if runtime.became_true_at.is_none() || runtime.scheduled_for.is_none() {
                runtime.became_true_at = Some(now);
                runtime.scheduled_for = Some(now + Duration::seconds(seconds));
                runtime.updated_at = now;
                repos.save_runtime(&runtime).await?;
                result.scheduled += 1;
                debug!(rule_id = rule.id, seconds, "for-delay armed");
            }
            continue;
        }

        let matched = rule.definition.when.as_ref().is_some_and(|when| {
            eval_condition_with_context(when, &entity_state, now, repos.sources())
        });
        if !matched {
            continue;
        }

        let mut runtime = repos.ensure_runtime(rule).await?;
        if cooldown_active(rule, &runtime, now) {
            result.skipped_cooldown += 1;
            continue;
        }

        let actions = rule.definition.then.clone();
        match executor.execute(rule, &actions, now).await {
            Ok(outcome) => {
                if !outcome.errors.is_empty() {
                    result.errors += 1;
                }
                repos
                    .append_action_log(RuleActionLog::from_result(
                        rule.id,
                        now,
                        rule.kind,
                        actions,
                        outcome,
                        TriggerTrace {
                            source: TriggerSource::Immediate,
                        },
                    ))
                    .await?;
                runtime.last_fired_at = Some(now);
                runtime.updated_at = now;
                repos.save_runtime(&runtime).await?;
                result.fired += 1;
                debug!(rule_id = rule.id, "rule fired");
            }
            Err(e) => {
                result.errors += 1;
                warn!(rule_id = rule.id, error = %e, "action execution failed");
                repos
                    .append_action_log(RuleActionLog::from_error(
                        rule.id,
                        now,
                        rule.kind,
                        actions,
                        TriggerTrace {
                            source: TriggerSource::Immediate,
                        },
                        e.to_string(),
                    ))
                    .await?;
            }
        }
    }

    Ok(result)
}

// ── Simulation (dry run) ────────────────────────────────────────────

/// Per-rule simulation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct SimulatedRule {
    pub id: i64,
    pub name: String,
    pub kind: RuleKind,
    pub priority: i32,
    pub matched: bool,
    #[serde(rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_delay: Option<ForDelayStatus>,
    pub trace: ConditionTrace,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// Status of a for-delayed rule inside a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct ForDelayStatus {
    pub seconds: i64,
    /// `"not_true"`, `"would_schedule"`, or `"assumed_satisfied"`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assumed_for_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub evaluated: usize,
    pub matched: usize,
    pub would_schedule: usize,
}

/// Result of a dry run; no actions execute, nothing persists.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub timestamp: DateTime<Utc>,
    pub summary: SimulationSummary,
    pub matched_rules: Vec<SimulatedRule>,
    pub non_matching_rules: Vec<SimulatedRule>,
}

/// Sources wrapper that overrides the alarm state for what-if questions.
struct AlarmOverride<'a> {
    inner: &'a dyn ConditionSources,
    alarm_state: Option<String>,
}

impl ConditionSources for AlarmOverride<'_> {
    fn alarm_state(&self) -> Option<String> {
        self.alarm_state.clone()
    }

    fn list_detections(
        &self,
        label: &str,
        cameras: &[String],
        since: DateTime<Utc>,
    ) -> Vec<latch_core::Detection> {
        self.inner.list_detections(label, cameras, since)
    }

    fn detector_available(&self, now: DateTime<Utc>) -> bool {
        self.inner.detector_available(now)
    }
}

/// Dry-run all enabled rules against caller-supplied entity states.
///
/// `entity_states` overlays the stored snapshot. `assume_for_seconds`
/// treats for-delays up to that long as already satisfied. `alarm_state`
/// overrides the repository-reported alarm state.
pub async fn simulate_rules<R>(
    repos: &R,
    entity_states: &HashMap<String, String>,
    now: DateTime<Utc>,
    assume_for_seconds: Option<i64>,
    alarm_state: Option<String>,
) -> Result<SimulationReport, LatchError>
where
    R: EngineRepos + ?Sized,
{
    let assume_for_seconds = assume_for_seconds.map(|s| s.max(0));
    let rules = repos.list_enabled_rules().await?;

    let mut merged_state: EntityStateMap = repos.entity_state_map().await?;
    for (entity_id, state) in entity_states {
        merged_state.insert(entity_id.clone(), Some(state.clone()));
    }

    let override_sources;
    let sources: &dyn ConditionSources = match alarm_state {
        Some(state) => {
            override_sources = AlarmOverride {
                inner: repos.sources(),
                alarm_state: Some(state),
            };
            &override_sources
        }
        None => repos.sources(),
    };

    let mut matched_rules: Vec<SimulatedRule> = Vec::new();
    let mut non_matching_rules: Vec<SimulatedRule> = Vec::new();

    for rule in &rules {
        let (seconds, child) = extract_for(rule.definition.when.as_ref());

        let report = |matched: bool, for_delay: Option<ForDelayStatus>, trace: ConditionTrace| {
            SimulatedRule {
                id: rule.id,
                name: rule.name.clone(),
                kind: rule.kind,
                priority: rule.priority,
                matched,
                for_delay,
                trace,
                actions: rule.definition.then.clone(),
            }
        };

        if let Some(seconds) = seconds {
            let (ok_child, trace) = match child {
                Some(child) => {
                    eval_condition_explain_with_context(child, &merged_state, now, sources)
                }
                None => (false, missing_when_trace()),
            };
            if !ok_child {
                non_matching_rules.push(report(
                    false,
                    Some(ForDelayStatus {
                        seconds,
                        status: "not_true".to_string(),
                        assumed_for_seconds: None,
                    }),
                    trace,
                ));
                continue;
            }
            let satisfied = assume_for_seconds.is_some_and(|assumed| assumed >= seconds);
            if satisfied {
                matched_rules.push(report(
                    true,
                    Some(ForDelayStatus {
                        seconds,
                        status: "assumed_satisfied".to_string(),
                        assumed_for_seconds: assume_for_seconds,
                    }),
                    trace,
                ));
            } else {
                matched_rules.push(report(
                    false,
                    Some(ForDelayStatus {
                        seconds,
                        status: "would_schedule".to_string(),
                        assumed_for_seconds: None,
                    }),
                    trace,
                ));
            }
            continue;
        }

        let (ok, trace) = match rule.definition.when.as_ref() {
            Some(when) => eval_condition_explain_with_context(when, &merged_state, now, sources),
            None => (false, missing_when_trace()),
        };
        let entry = report(ok, None, trace);
        if ok {
            matched_rules.push(entry);
        } else {
            non_matching_rules.push(entry);
        }
    }

    let summary = SimulationSummary {
        evaluated: rules.len(),
        matched: matched_rules.iter().filter(|r| r.matched).count(),
        would_schedule: matched_rules
            .iter()
            .filter(|r| {
                r.for_delay
                    .as_ref()
                    .is_some_and(|f| f.status == "would_schedule")
            })
            .count(),
    };

    Ok(SimulationReport {
        timestamp: now,
        summary,
        matched_rules,
        non_matching_rules,
    })
}

fn missing_when_trace() -> ConditionTrace {
    ConditionTrace {
        op: "none".to_string(),
        ok: false,
        reason: Some("missing_when".to_string()),
        children: Vec::new(),
        child: None,
        detail: serde_json::Map::new(),
    }
}
