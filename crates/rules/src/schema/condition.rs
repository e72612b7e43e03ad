//! Condition tree schema for rule WHEN clauses.
//!
//! The tree is a tagged union keyed by `op`; deserialization through serde
//! is the single place the dynamic JSON shape crosses into typed code.
//! Structural problems (unknown op, wrong field types) fail at parse time;
//! semantic problems (empty children, bad time windows) are caught by
//! [`crate::validation`] at save time and coerced to `false` by the
//! evaluator for trees that bypassed validation.

use serde::{Deserialize, Serialize};

/// Weekday tokens accepted by `time_in_range`, Monday first.
pub const DAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// A node in a rule's WHEN condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConditionNode {
    /// Every child must hold. Empty children evaluate to false.
    All { children: Vec<ConditionNode> },
    /// At least one child must hold. Empty children evaluate to false.
    Any { children: Vec<ConditionNode> },
    /// Boolean negation of exactly one child.
    Not { child: Box<ConditionNode> },
    /// The child must hold continuously for `seconds` before firing.
    ///
    /// Only legal at the tree root; the engine extracts it and tracks
    /// continuity through runtime state. The evaluator itself treats a
    /// nested `for` as false.
    For {
        seconds: i64,
        child: Box<ConditionNode>,
    },
    /// Strict equality against the latest known entity state.
    EntityState { entity_id: String, equals: String },
    /// Current alarm state is one of `states`.
    AlarmStateIn { states: Vec<String> },
    /// Local wall-clock time falls inside a window on allowed weekdays.
    ///
    /// When `end <= start` the window wraps across midnight.
    TimeInRange {
        start: String,
        end: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        days: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
    /// A recent person detection from the vision system.
    FrigatePersonDetected {
        cameras: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zones: Option<Vec<String>>,
        within_seconds: i64,
        min_confidence_pct: f64,
        #[serde(default)]
        aggregation: Aggregation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percentile: Option<i64>,
        #[serde(default)]
        on_unavailable: OnUnavailable,
    },
}

/// How multiple detection confidences collapse to a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Max,
    Latest,
    Percentile,
}

/// Behavior when the detector reports no candidates and looks offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnUnavailable {
    #[default]
    TreatAsNoMatch,
    TreatAsMatch,
}

/// Split a root `for` operator into its delay and child.
///
/// Returns `(Some(seconds), Some(child))` for a well-formed root `for`,
/// `(None, Some(child))` when the `for` carries a non-positive delay, and
/// `(None, node)` for any other root.
pub fn extract_for(node: Option<&ConditionNode>) -> (Option<i64>, Option<&ConditionNode>) {
    match node {
        Some(ConditionNode::For { seconds, child }) if *seconds > 0 => {
            (Some(*seconds), Some(child))
        }
        Some(ConditionNode::For { child, .. }) => (None, Some(child)),
        other => (None, other),
    }
}

/// Parse `"HH:MM"` into minutes since midnight.
pub(crate) fn parse_hhmm(value: &str) -> Option<u32> {
    let value = value.trim();
    let bytes = value.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    let hour: u32 = value[0..2].parse().ok()?;
    let minute: u32 = value[3..5].parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(hour * 60 + minute)
}

/// Normalize a day list to lowercase unique tokens (`None` means every day).
pub(crate) fn normalize_days(value: Option<&[String]>) -> Result<Vec<String>, String> {
    let Some(raw) = value else {
        return Ok(DAYS.iter().map(|d| d.to_string()).collect());
    };
    let mut normalized: Vec<String> = Vec::new();
    for token in raw {
        let day = token.trim().to_lowercase();
        if !DAYS.contains(&day.as_str()) {
            return Err(format!("invalid day: {token}"));
        }
        if !normalized.contains(&day) {
            normalized.push(day);
        }
    }
    if normalized.is_empty() {
        return Err("must include at least one day".to_string());
    }
    Ok(normalized)
}

/// A resolved time zone for `time_in_range` evaluation.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResolvedZone {
    /// The host's local zone (`tz` omitted or `"system"`).
    System,
    Named(chrono_tz::Tz),
}

impl ResolvedZone {
    /// Local weekday token and minutes since midnight at `now`.
    pub(crate) fn local_parts(&self, now: chrono::DateTime<chrono::Utc>) -> (&'static str, u32) {
        use chrono::{Datelike, Timelike};
        match self {
            ResolvedZone::System => {
                let local = now.with_timezone(&chrono::Local);
                (
                    DAYS[local.weekday().num_days_from_monday() as usize],
                    local.hour() * 60 + local.minute(),
                )
            }
            ResolvedZone::Named(tz) => {
                let local = now.with_timezone(tz);
                (
                    DAYS[local.weekday().num_days_from_monday() as usize],
                    local.hour() * 60 + local.minute(),
                )
            }
        }
    }
}

/// Resolve `tz` into a zone (`None`/empty/`"system"` means the host zone).
pub(crate) fn resolve_zone(value: Option<&str>) -> Result<ResolvedZone, String> {
    match value.map(str::trim) {
        None | Some("") | Some("system") => Ok(ResolvedZone::System),
        Some(name) => name
            .parse::<chrono_tz::Tz>()
            .map(ResolvedZone::Named)
            .map_err(|_| "invalid time zone id".to_string()),
    }
}
