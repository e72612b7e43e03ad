//! Explain-mode evaluation: the same boolean result plus a trace tree.
//!
//! Used by the simulation endpoint and rule debugging. Traces mirror the
//! condition tree node-for-node, recording per-node outcome, a failure
//! reason where one applies, and operator-specific diagnostics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};

use crate::schema::{
    normalize_days, parse_hhmm, resolve_zone, Aggregation, ConditionNode, OnUnavailable,
};

use super::{
    aggregate_confidence, clean_strings, frigate_candidates, minutes_in_window, Aggregate,
    ConditionSources, EntityStateMap, NullSources,
};

/// Per-node evaluation trace, parallel to the condition tree.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionTrace {
    pub op: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConditionTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child: Option<Box<ConditionTrace>>,
    /// Operator-specific diagnostics (expected/actual state, counts, ...).
    #[serde(flatten)]
    pub detail: Map<String, JsonValue>,
}

impl ConditionTrace {
    fn leaf(op: &str, ok: bool) -> Self {
        Self {
            op: op.to_string(),
            ok,
            reason: None,
            children: Vec::new(),
            child: None,
            detail: Map::new(),
        }
    }

    fn failed(op: &str, reason: &str) -> Self {
        let mut trace = Self::leaf(op, false);
        trace.reason = Some(reason.to_string());
        trace
    }

    fn with_detail(mut self, detail: Map<String, JsonValue>) -> Self {
        self.detail = detail;
        self
    }
}

fn detail_map(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

/// Evaluate with trace using only an entity-state snapshot.
pub fn eval_condition_explain(
    node: &ConditionNode,
    entity_state: &EntityStateMap,
) -> (bool, ConditionTrace) {
    eval_condition_explain_with_context(node, entity_state, Utc::now(), &NullSources)
}

/// Evaluate with trace and full repository-backed context.
///
/// Unlike the plain evaluator, logical operators do not short-circuit here:
/// every child is traced so the caller sees the whole picture.
pub fn eval_condition_explain_with_context(
    node: &ConditionNode,
    entity_state: &EntityStateMap,
    now: DateTime<Utc>,
    sources: &dyn ConditionSources,
) -> (bool, ConditionTrace) {
    match node {
        ConditionNode::All { children } => {
            if children.is_empty() {
                return (false, ConditionTrace::failed("all", "missing_children"));
            }
            let mut traces = Vec::with_capacity(children.len());
            let mut ok_all = true;
            for child in children {
                let (ok, trace) =
                    eval_condition_explain_with_context(child, entity_state, now, sources);
                traces.push(trace);
                if !ok {
                    ok_all = false;
                }
            }
            let mut trace = ConditionTrace::leaf("all", ok_all);
            trace.children = traces;
            (ok_all, trace)
        }
        ConditionNode::Any { children } => {
            if children.is_empty() {
                return (false, ConditionTrace::failed("any", "missing_children"));
            }
            let mut traces = Vec::with_capacity(children.len());
            let mut ok_any = false;
            for child in children {
                let (ok, trace) =
                    eval_condition_explain_with_context(child, entity_state, now, sources);
                traces.push(trace);
                if ok {
                    ok_any = true;
                }
            }
            let mut trace = ConditionTrace::leaf("any", ok_any);
            trace.children = traces;
            (ok_any, trace)
        }
        ConditionNode::Not { child } => {
            let (ok_child, child_trace) =
                eval_condition_explain_with_context(child, entity_state, now, sources);
            let mut trace = ConditionTrace::leaf("not", !ok_child);
            trace.child = Some(Box::new(child_trace));
            (!ok_child, trace)
        }
        ConditionNode::For { .. } => (false, ConditionTrace::failed("for", "unsupported_op")),
        ConditionNode::EntityState { entity_id, equals } => {
            let actual = entity_state.get(entity_id).cloned().flatten();
            let ok = actual.as_deref() == Some(equals.as_str());
            let trace = ConditionTrace::leaf("entity_state", ok).with_detail(detail_map(json!({
                "entity_id": entity_id,
                "expected": equals,
                "actual": actual,
            })));
            (ok, trace)
        }
        ConditionNode::AlarmStateIn { states } => {
            let states = clean_strings(states);
            if states.is_empty() {
                return (
                    false,
                    ConditionTrace::failed("alarm_state_in", "missing_states"),
                );
            }
            let current = sources.alarm_state();
            let ok = current
                .as_deref()
                .is_some_and(|c| states.iter().any(|s| s == c));
            let trace = ConditionTrace::leaf("alarm_state_in", ok).with_detail(detail_map(json!({
                "states": states,
                "current_state": current,
            })));
            (ok, trace)
        }
        ConditionNode::TimeInRange {
            start,
            end,
            days,
            tz,
        } => explain_time_in_range(start, end, days.as_deref(), tz.as_deref(), now),
        ConditionNode::FrigatePersonDetected {
            cameras,
            zones,
            within_seconds,
            min_confidence_pct,
            aggregation,
            percentile,
            on_unavailable,
        } => explain_frigate(
            cameras,
            zones.as_deref(),
            *within_seconds,
            *min_confidence_pct,
            *aggregation,
            *percentile,
            *on_unavailable,
            now,
            sources,
        ),
    }
}

fn explain_time_in_range(
    start: &str,
    end: &str,
    days: Option<&[String]>,
    tz: Option<&str>,
    now: DateTime<Utc>,
) -> (bool, ConditionTrace) {
    let (start_min, end_min) = (parse_hhmm(start), parse_hhmm(end));
    let (Some(start_min), Some(end_min)) = (start_min, end_min) else {
        let trace = ConditionTrace::failed("time_in_range", "invalid_start_end")
            .with_detail(detail_map(json!({"start": start, "end": end})));
        return (false, trace);
    };
    if start_min == end_min {
        let trace = ConditionTrace::failed("time_in_range", "invalid_start_end")
            .with_detail(detail_map(json!({"start": start, "end": end})));
        return (false, trace);
    }

    let days = match normalize_days(days) {
        Ok(days) => days,
        Err(err) => {
            let trace = ConditionTrace::failed("time_in_range", "invalid_days_or_tz")
                .with_detail(detail_map(json!({"days_error": err})));
            return (false, trace);
        }
    };
    let zone = match resolve_zone(tz) {
        Ok(zone) => zone,
        Err(err) => {
            let trace = ConditionTrace::failed("time_in_range", "invalid_days_or_tz")
                .with_detail(detail_map(json!({"tz_error": err})));
            return (false, trace);
        }
    };

    let (weekday, current_min) = zone.local_parts(now);
    if !days.iter().any(|d| d == weekday) {
        let trace = ConditionTrace::failed("time_in_range", "day_not_allowed").with_detail(
            detail_map(json!({"weekday": weekday, "days": days})),
        );
        return (false, trace);
    }

    let ok = minutes_in_window(current_min, start_min, end_min);
    let trace = ConditionTrace::leaf("time_in_range", ok).with_detail(detail_map(json!({
        "start": start,
        "end": end,
        "weekday": weekday,
        "tz": tz.unwrap_or("system"),
    })));
    (ok, trace)
}

#[allow(clippy::too_many_arguments)]
fn explain_frigate(
    cameras: &[String],
    zones: Option<&[String]>,
    within_seconds: i64,
    min_confidence_pct: f64,
    aggregation: Aggregation,
    percentile: Option<i64>,
    on_unavailable: OnUnavailable,
    now: DateTime<Utc>,
    sources: &dyn ConditionSources,
) -> (bool, ConditionTrace) {
    const OP: &str = "frigate_person_detected";

    let cameras = clean_strings(cameras);
    if cameras.is_empty() {
        return (false, ConditionTrace::failed(OP, "missing_cameras"));
    }
    if within_seconds <= 0 {
        return (false, ConditionTrace::failed(OP, "invalid_within_seconds"));
    }
    if !(0.0..=100.0).contains(&min_confidence_pct) {
        return (false, ConditionTrace::failed(OP, "invalid_threshold"));
    }

    let zone_list: Vec<String> = zones.map(|z| clean_strings(z)).unwrap_or_default();
    let candidates = frigate_candidates(sources, &cameras, zones, within_seconds, now);

    let base = json!({
        "label": "person",
        "cameras": cameras,
        "zones": zone_list,
        "within_seconds": within_seconds,
        "aggregation": aggregation,
        "percentile": if aggregation == Aggregation::Percentile { percentile } else { None },
        "min_confidence_pct": min_confidence_pct,
    });

    match aggregate_confidence(&candidates, aggregation, percentile) {
        Aggregate::Value(value) => {
            let ok = value >= min_confidence_pct;
            let mut detail = detail_map(base);
            detail.extend(detail_map(json!({
                "candidates_count": candidates.len(),
                "value_pct": value,
            })));
            (ok, ConditionTrace::leaf(OP, ok).with_detail(detail))
        }
        Aggregate::InvalidPercentile => {
            (false, ConditionTrace::failed(OP, "invalid_percentile"))
        }
        Aggregate::Empty => {
            let available = sources.detector_available(now);
            let ok = !available && on_unavailable == OnUnavailable::TreatAsMatch;
            let reason = if ok {
                "unavailable_treated_as_match"
            } else if !available {
                "unavailable"
            } else {
                "no_candidates"
            };
            let mut detail = detail_map(base);
            detail.extend(detail_map(json!({
                "candidates_count": 0,
                "value_pct": null,
                "available": available,
                "on_unavailable": on_unavailable,
            })));
            let mut trace = ConditionTrace::leaf(OP, ok).with_detail(detail);
            trace.reason = Some(reason.to_string());
            (ok, trace)
        }
    }
}
