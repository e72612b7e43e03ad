//! Failure handling and circuit breaker for rule evaluation.
//!
//! Failure state lives on the rule's [`RuleRuntimeState`]; these functions
//! mutate it in place and the caller persists through its repositories.
//! Repeated failures back off exponentially; at the threshold the rule is
//! suspended for a fixed recovery period, after which one evaluation is
//! allowed through (`auto_recovery`) and decides whether it reopens.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use latch_rules::schema::{Rule, RuleRuntimeState, RuntimeStatus};

/// Exponential backoff schedule: 1min, 5min, 15min, 1hr (cap).
pub const BACKOFF_SCHEDULE_SECONDS: [i64; 4] = [60, 300, 900, 3600];

/// Consecutive failures before a rule is suspended.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 10;

/// Suspended rules may retry after this period.
pub const AUTO_RECOVERY_SECONDS: i64 = 3600;

/// Stored error messages are capped at this length.
const MAX_ERROR_LEN: usize = 500;

/// Backoff delay for the given consecutive-failure count (1-based).
pub fn get_backoff_seconds(consecutive_failures: u32) -> i64 {
    if consecutive_failures < 1 {
        return 0;
    }
    let idx = (consecutive_failures as usize - 1).min(BACKOFF_SCHEDULE_SECONDS.len() - 1);
    BACKOFF_SCHEDULE_SECONDS[idx]
}

fn truncate_error(error: &str) -> String {
    if error.chars().count() > MAX_ERROR_LEN {
        let head: String = error.chars().take(MAX_ERROR_LEN - 3).collect();
        format!("{head}...")
    } else {
        error.to_string()
    }
}

/// Record an evaluation failure on the runtime state.
///
/// Increments the failure counter, stores the (truncated) error, and sets
/// `next_allowed_at` from the backoff schedule. At the threshold the rule
/// flips to `error_suspended` with the auto-recovery delay instead.
pub fn record_rule_failure(
    rule: &Rule,
    runtime: &mut RuleRuntimeState,
    error: &str,
    now: DateTime<Utc>,
) {
    runtime.consecutive_failures += 1;
    runtime.last_failure_at = Some(now);
    runtime.last_error = truncate_error(error);

    if runtime.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD {
        runtime.error_suspended = true;
        runtime.status = RuntimeStatus::ErrorSuspended;
        runtime.next_allowed_at = Some(now + Duration::seconds(AUTO_RECOVERY_SECONDS));
        warn!(
            rule_id = rule.id,
            rule_name = %rule.name,
            failures = runtime.consecutive_failures,
            "rule suspended after consecutive failures"
        );
    } else {
        let backoff = get_backoff_seconds(runtime.consecutive_failures);
        runtime.next_allowed_at = Some(now + Duration::seconds(backoff));
        info!(
            rule_id = rule.id,
            rule_name = %rule.name,
            failures = runtime.consecutive_failures,
            backoff_seconds = backoff,
            "rule backing off after failure"
        );
    }
    runtime.updated_at = now;
}

/// Record a successful evaluation, clearing all failure fields.
///
/// Returns `true` when anything changed (the caller can skip the save when
/// the state was already clean).
pub fn record_rule_success(runtime: &mut RuleRuntimeState) -> bool {
    if runtime.consecutive_failures == 0 && !runtime.error_suspended {
        return false;
    }
    runtime.consecutive_failures = 0;
    runtime.last_failure_at = None;
    runtime.next_allowed_at = None;
    runtime.error_suspended = false;
    runtime.last_error = String::new();
    runtime.status = RuntimeStatus::Pending;
    runtime.updated_at = Utc::now();
    true
}

/// Whether a rule may be evaluated now, with the gating reason.
///
/// Reasons: `"allowed"`, `"auto_recovery"` (suspension elapsed, one try
/// allowed), `"suspended"`, or `"backoff:<remaining>s"`.
pub fn is_rule_allowed(runtime: &RuleRuntimeState, now: DateTime<Utc>) -> (bool, String) {
    if runtime.error_suspended {
        if runtime.next_allowed_at.is_some_and(|at| now >= at) {
            return (true, "auto_recovery".to_string());
        }
        return (false, "suspended".to_string());
    }

    if let Some(next_allowed_at) = runtime.next_allowed_at {
        if now < next_allowed_at {
            let remaining = (next_allowed_at - now).num_seconds();
            return (false, format!("backoff:{remaining}s"));
        }
    }

    (true, "allowed".to_string())
}

/// Manually clear a rule's suspension (admin force-retry).
///
/// Equivalent to recording a success.
pub fn clear_suspension(runtime: &mut RuleRuntimeState) {
    record_rule_success(runtime);
    info!(rule_id = runtime.rule_id, "cleared rule suspension");
}
