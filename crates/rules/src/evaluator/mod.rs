//! Pure condition-tree evaluator.
//!
//! Walks a [`ConditionNode`] against an entity-state snapshot, the
//! evaluation instant, and a [`ConditionSources`] view of repository-backed
//! context (alarm state, vision detections). The walk never performs I/O
//! beyond those source calls and never mutates anything; source failures
//! coerce to conservative defaults so evaluation stays deterministic when
//! an integration is unreachable.
//!
//! The `for` operator is not evaluated here: the engine extracts it at the
//! root and tracks continuity through runtime state. A `for` nested deeper
//! in the tree evaluates to false (validation rejects such trees).

mod explain;

pub use explain::{eval_condition_explain, eval_condition_explain_with_context, ConditionTrace};

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use latch_core::Detection;

use crate::schema::{
    normalize_days, parse_hhmm, resolve_zone, Aggregation, ConditionNode, OnUnavailable,
};

/// Snapshot of `entity_id → last_state` used by `entity_state` nodes.
pub type EntityStateMap = HashMap<String, Option<String>>;

/// Repository-backed context consulted by condition operators.
///
/// Implementations must coerce backend errors to the documented defaults
/// (`None`, empty, `false`) instead of surfacing them; the evaluator treats
/// what it gets as ground truth.
pub trait ConditionSources: Send + Sync {
    /// Current alarm state, or `None` when unknown/unreachable.
    fn alarm_state(&self) -> Option<String>;

    /// Detections with the given label on the given cameras observed at or
    /// after `since`, ordered oldest first.
    fn list_detections(&self, label: &str, cameras: &[String], since: DateTime<Utc>)
        -> Vec<Detection>;

    /// Whether the vision detector looks reachable at `now`.
    fn detector_available(&self, now: DateTime<Utc>) -> bool;
}

/// Context-free sources: no alarm state, no detections, detector offline.
pub struct NullSources;

impl ConditionSources for NullSources {
    fn alarm_state(&self) -> Option<String> {
        None
    }

    fn list_detections(&self, _: &str, _: &[String], _: DateTime<Utc>) -> Vec<Detection> {
        Vec::new()
    }

    fn detector_available(&self, _: DateTime<Utc>) -> bool {
        false
    }
}

/// Evaluate a condition using only an entity-state snapshot.
pub fn eval_condition(node: &ConditionNode, entity_state: &EntityStateMap) -> bool {
    eval_condition_with_context(node, entity_state, Utc::now(), &NullSources)
}

/// Evaluate a condition with full repository-backed context.
pub fn eval_condition_with_context(
    node: &ConditionNode,
    entity_state: &EntityStateMap,
    now: DateTime<Utc>,
    sources: &dyn ConditionSources,
) -> bool {
    match node {
        ConditionNode::All { children } => {
            !children.is_empty()
                && children
                    .iter()
                    .all(|child| eval_condition_with_context(child, entity_state, now, sources))
        }
        ConditionNode::Any { children } => {
            !children.is_empty()
                && children
                    .iter()
                    .any(|child| eval_condition_with_context(child, entity_state, now, sources))
        }
        ConditionNode::Not { child } => {
            !eval_condition_with_context(child, entity_state, now, sources)
        }
        // Continuity is the engine's job; a nested `for` never matches.
        ConditionNode::For { .. } => false,
        ConditionNode::EntityState { entity_id, equals } => entity_state
            .get(entity_id)
            .is_some_and(|state| state.as_deref() == Some(equals.as_str())),
        ConditionNode::AlarmStateIn { states } => {
            let states = clean_strings(states);
            if states.is_empty() {
                return false;
            }
            sources
                .alarm_state()
                .is_some_and(|current| states.iter().any(|s| s == &current))
        }
        ConditionNode::TimeInRange {
            start,
            end,
            days,
            tz,
        } => time_window_matches(start, end, days.as_deref(), tz.as_deref(), now),
        ConditionNode::FrigatePersonDetected {
            cameras,
            zones,
            within_seconds,
            min_confidence_pct,
            aggregation,
            percentile,
            on_unavailable,
        } => {
            let cameras = clean_strings(cameras);
            if cameras.is_empty() || *within_seconds <= 0 {
                return false;
            }
            let threshold = *min_confidence_pct;
            if !(0.0..=100.0).contains(&threshold) {
                return false;
            }

            let candidates =
                frigate_candidates(sources, &cameras, zones.as_deref(), *within_seconds, now);
            match aggregate_confidence(&candidates, *aggregation, *percentile) {
                Aggregate::Value(value) => value >= threshold,
                Aggregate::InvalidPercentile => false,
                Aggregate::Empty => {
                    !sources.detector_available(now)
                        && *on_unavailable == OnUnavailable::TreatAsMatch
                }
            }
        }
    }
}

/// Whether `now` falls inside the configured window on an allowed weekday.
pub(crate) fn time_window_matches(
    start: &str,
    end: &str,
    days: Option<&[String]>,
    tz: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    let (Some(start_min), Some(end_min)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };
    if start_min == end_min {
        return false;
    }
    let Ok(days) = normalize_days(days) else {
        return false;
    };
    let Ok(zone) = resolve_zone(tz) else {
        return false;
    };

    let (weekday, current_min) = zone.local_parts(now);
    if !days.iter().any(|d| d == weekday) {
        return false;
    }
    minutes_in_window(current_min, start_min, end_min)
}

/// Half-open window check with midnight wrap when `end < start`.
pub(crate) fn minutes_in_window(current: u32, start: u32, end: u32) -> bool {
    if end > start {
        current >= start && current < end
    } else {
        current >= start || current < end
    }
}

/// Trimmed, non-empty copies of the input strings.
pub(crate) fn clean_strings(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Detections within the window, optionally narrowed to matching zones.
pub(crate) fn frigate_candidates(
    sources: &dyn ConditionSources,
    cameras: &[String],
    zones: Option<&[String]>,
    within_seconds: i64,
    now: DateTime<Utc>,
) -> Vec<Detection> {
    let since = now - chrono::Duration::seconds(within_seconds);
    let mut candidates = sources.list_detections("person", cameras, since);
    if let Some(zones) = zones {
        let wanted = clean_strings(zones);
        if !wanted.is_empty() {
            candidates.retain(|c| c.zones.iter().any(|z| wanted.iter().any(|w| w == z)));
        }
    }
    candidates
}

/// Result of collapsing detection confidences to one value.
pub(crate) enum Aggregate {
    Value(f64),
    /// No candidates survived filtering.
    Empty,
    /// Percentile aggregation without a valid percentile.
    InvalidPercentile,
}

/// Collapse candidate confidences according to the aggregation policy.
pub(crate) fn aggregate_confidence(
    candidates: &[Detection],
    aggregation: Aggregation,
    percentile: Option<i64>,
) -> Aggregate {
    if candidates.is_empty() {
        return Aggregate::Empty;
    }
    match aggregation {
        Aggregation::Max => Aggregate::Value(
            candidates
                .iter()
                .map(|c| c.confidence_pct)
                .fold(f64::MIN, f64::max),
        ),
        Aggregation::Latest => {
            let latest = candidates
                .iter()
                .max_by_key(|c| c.observed_at)
                .expect("candidates checked non-empty");
            Aggregate::Value(latest.confidence_pct)
        }
        Aggregation::Percentile => {
            let scores: Vec<f64> = candidates.iter().map(|c| c.confidence_pct).collect();
            match percentile.and_then(|p| nearest_rank_percentile(&scores, p)) {
                Some(value) => Aggregate::Value(value),
                None => Aggregate::InvalidPercentile,
            }
        }
    }
}

/// Nearest-rank percentile (p in 1..=100) over the scores.
///
/// Sort ascending, rank `k = ⌈p/100·n⌉` clamped to `[1, n]`, return the
/// k-th value.
pub fn nearest_rank_percentile(scores: &[f64], p: i64) -> Option<f64> {
    if scores.is_empty() || p <= 0 || p > 100 {
        return None;
    }
    let mut ordered = scores.to_vec();
    ordered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = ordered.len();
    let k = ((p as f64 / 100.0) * n as f64).ceil() as usize;
    let k = k.clamp(1, n);
    Some(ordered[k - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn state(pairs: &[(&str, Option<&str>)]) -> EntityStateMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    fn node(json: serde_json::Value) -> ConditionNode {
        serde_json::from_value(json).unwrap()
    }

    struct StubSources {
        alarm: Option<String>,
        detections: Vec<Detection>,
        available: bool,
        queries: Mutex<Vec<(String, Vec<String>, DateTime<Utc>)>>,
    }

    impl StubSources {
        fn new() -> Self {
            Self {
                alarm: None,
                detections: Vec::new(),
                available: true,
                queries: Mutex::new(Vec::new()),
            }
        }

        fn with_alarm(state: &str) -> Self {
            Self {
                alarm: Some(state.to_string()),
                ..Self::new()
            }
        }
    }

    impl ConditionSources for StubSources {
        fn alarm_state(&self) -> Option<String> {
            self.alarm.clone()
        }

        fn list_detections(
            &self,
            label: &str,
            cameras: &[String],
            since: DateTime<Utc>,
        ) -> Vec<Detection> {
            self.queries.lock().unwrap().push((
                label.to_string(),
                cameras.to_vec(),
                since,
            ));
            self.detections
                .iter()
                .filter(|d| cameras.contains(&d.camera) && d.observed_at >= since)
                .cloned()
                .collect()
        }

        fn detector_available(&self, _: DateTime<Utc>) -> bool {
            self.available
        }
    }

    fn detection(camera: &str, zones: &[&str], confidence: f64, observed_at: DateTime<Utc>) -> Detection {
        Detection {
            provider: "frigate".to_string(),
            event_id: format!("ev-{confidence}"),
            label: "person".to_string(),
            camera: camera.to_string(),
            zones: zones.iter().map(|z| z.to_string()).collect(),
            confidence_pct: confidence,
            observed_at,
        }
    }

    // ── entity_state / logic operators ──────────────────────────────

    #[test]
    fn test_entity_state_strict_equality() {
        let cond = node(serde_json::json!(
            {"op": "entity_state", "entity_id": "door", "equals": "on"}
        ));
        assert!(eval_condition(&cond, &state(&[("door", Some("on"))])));
        assert!(!eval_condition(&cond, &state(&[("door", Some("off"))])));
        assert!(!eval_condition(&cond, &state(&[("door", None)])));
        // Missing entity is treated as unequal.
        assert!(!eval_condition(&cond, &state(&[])));
    }

    #[test]
    fn test_all_any_not_semantics() {
        let on = serde_json::json!({"op": "entity_state", "entity_id": "a", "equals": "on"});
        let off = serde_json::json!({"op": "entity_state", "entity_id": "a", "equals": "off"});
        let snapshot = state(&[("a", Some("on"))]);

        assert!(eval_condition(
            &node(serde_json::json!({"op": "all", "children": [on.clone(), on.clone()]})),
            &snapshot
        ));
        assert!(!eval_condition(
            &node(serde_json::json!({"op": "all", "children": [on.clone(), off.clone()]})),
            &snapshot
        ));
        assert!(eval_condition(
            &node(serde_json::json!({"op": "any", "children": [off.clone(), on.clone()]})),
            &snapshot
        ));
        assert!(!eval_condition(
            &node(serde_json::json!({"op": "any", "children": [off.clone()]})),
            &snapshot
        ));
        assert!(eval_condition(
            &node(serde_json::json!({"op": "not", "child": off})),
            &snapshot
        ));

        // Empty children always evaluate false.
        assert!(!eval_condition(
            &node(serde_json::json!({"op": "all", "children": []})),
            &snapshot
        ));
        assert!(!eval_condition(
            &node(serde_json::json!({"op": "any", "children": []})),
            &snapshot
        ));
    }

    #[test]
    fn test_nested_for_never_matches() {
        let cond = node(serde_json::json!({
            "op": "all",
            "children": [
                {"op": "for", "seconds": 10,
                 "child": {"op": "entity_state", "entity_id": "a", "equals": "on"}}
            ]
        }));
        assert!(!eval_condition(&cond, &state(&[("a", Some("on"))])));
    }

    // ── alarm_state_in ──────────────────────────────────────────────

    #[test]
    fn test_alarm_state_in() {
        let cond = node(serde_json::json!(
            {"op": "alarm_state_in", "states": ["armed_home", "armed_away"]}
        ));
        let snapshot = state(&[]);
        let now = Utc::now();

        let armed = StubSources::with_alarm("armed_home");
        assert!(eval_condition_with_context(&cond, &snapshot, now, &armed));

        let disarmed = StubSources::with_alarm("disarmed");
        assert!(!eval_condition_with_context(&cond, &snapshot, now, &disarmed));

        // Unknown alarm state (integration unreachable) coerces to false.
        assert!(!eval_condition_with_context(&cond, &snapshot, now, &NullSources));
    }

    // ── time_in_range ───────────────────────────────────────────────

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // 2026-01-05 is a Monday.
        Utc.with_ymd_and_hms(2026, 1, 5, h, m, 0).unwrap()
    }

    #[test]
    fn test_time_in_range_plain_window() {
        let cond = node(serde_json::json!(
            {"op": "time_in_range", "start": "09:00", "end": "17:00", "tz": "UTC"}
        ));
        let snapshot = state(&[]);
        assert!(eval_condition_with_context(&cond, &snapshot, at(9, 0), &NullSources));
        assert!(eval_condition_with_context(&cond, &snapshot, at(16, 59), &NullSources));
        // End is exclusive.
        assert!(!eval_condition_with_context(&cond, &snapshot, at(17, 0), &NullSources));
        assert!(!eval_condition_with_context(&cond, &snapshot, at(8, 59), &NullSources));
    }

    #[test]
    fn test_time_in_range_wraps_midnight() {
        let cond = node(serde_json::json!(
            {"op": "time_in_range", "start": "22:00", "end": "06:00", "tz": "UTC"}
        ));
        let snapshot = state(&[]);
        assert!(eval_condition_with_context(&cond, &snapshot, at(23, 30), &NullSources));
        assert!(eval_condition_with_context(&cond, &snapshot, at(5, 59), &NullSources));
        assert!(!eval_condition_with_context(&cond, &snapshot, at(6, 0), &NullSources));
        assert!(!eval_condition_with_context(&cond, &snapshot, at(12, 0), &NullSources));
    }

    #[test]
    fn test_time_in_range_day_filter() {
        let cond = node(serde_json::json!(
            {"op": "time_in_range", "start": "00:00", "end": "23:59",
             "days": ["tue"], "tz": "UTC"}
        ));
        // Monday does not match a tue-only window.
        assert!(!eval_condition_with_context(&cond, &state(&[]), at(12, 0), &NullSources));
    }

    #[test]
    fn test_time_in_range_named_zone() {
        // 22:30 UTC on Monday is 23:30 in Berlin (winter, UTC+1).
        let cond = node(serde_json::json!(
            {"op": "time_in_range", "start": "23:00", "end": "23:45",
             "tz": "Europe/Berlin"}
        ));
        assert!(eval_condition_with_context(&cond, &state(&[]), at(22, 30), &NullSources));
        assert!(!eval_condition_with_context(&cond, &state(&[]), at(23, 30), &NullSources));
    }

    #[test]
    fn test_time_in_range_invalid_inputs() {
        let snapshot = state(&[]);
        for cond in [
            serde_json::json!({"op": "time_in_range", "start": "9:00", "end": "17:00"}),
            serde_json::json!({"op": "time_in_range", "start": "09:00", "end": "09:00"}),
            serde_json::json!({"op": "time_in_range", "start": "09:00", "end": "17:00", "tz": "Mars/Olympus"}),
            serde_json::json!({"op": "time_in_range", "start": "09:00", "end": "17:00", "days": ["blursday"]}),
        ] {
            assert!(!eval_condition_with_context(&node(cond), &snapshot, at(12, 0), &NullSources));
        }
    }

    // ── frigate_person_detected ─────────────────────────────────────

    fn frigate_node(extra: serde_json::Value) -> ConditionNode {
        let mut base = serde_json::json!({
            "op": "frigate_person_detected",
            "cameras": ["driveway"],
            "within_seconds": 30,
            "min_confidence_pct": 80,
        });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        node(base)
    }

    #[test]
    fn test_frigate_max_aggregation() {
        let now = Utc::now();
        let mut sources = StubSources::new();
        sources.detections = vec![
            detection("driveway", &[], 70.0, now - chrono::Duration::seconds(10)),
            detection("driveway", &[], 85.0, now - chrono::Duration::seconds(20)),
        ];
        let cond = frigate_node(serde_json::json!({}));
        assert!(eval_condition_with_context(&cond, &state(&[]), now, &sources));

        // Only detections inside the window are queried.
        let (label, cameras, since) = sources.queries.lock().unwrap()[0].clone();
        assert_eq!(label, "person");
        assert_eq!(cameras, vec!["driveway".to_string()]);
        assert_eq!(since, now - chrono::Duration::seconds(30));
    }

    #[test]
    fn test_frigate_latest_aggregation() {
        let now = Utc::now();
        let mut sources = StubSources::new();
        sources.detections = vec![
            detection("driveway", &[], 95.0, now - chrono::Duration::seconds(25)),
            detection("driveway", &[], 60.0, now - chrono::Duration::seconds(5)),
        ];
        // Latest detection (60%) is below the threshold even though an older
        // one would pass.
        let cond = frigate_node(serde_json::json!({"aggregation": "latest"}));
        assert!(!eval_condition_with_context(&cond, &state(&[]), now, &sources));
    }

    #[test]
    fn test_frigate_zone_filter() {
        let now = Utc::now();
        let mut sources = StubSources::new();
        sources.detections = vec![
            detection("driveway", &["street"], 99.0, now - chrono::Duration::seconds(5)),
        ];
        let cond = frigate_node(serde_json::json!({"zones": ["porch"]}));
        // Candidate zone does not intersect; detector is available, so the
        // empty result stays a no-match.
        assert!(!eval_condition_with_context(&cond, &state(&[]), now, &sources));

        let cond = frigate_node(serde_json::json!({"zones": ["street", "porch"]}));
        assert!(eval_condition_with_context(&cond, &state(&[]), now, &sources));
    }

    #[test]
    fn test_frigate_unavailable_policy() {
        let now = Utc::now();
        let mut sources = StubSources::new();
        sources.available = false;

        let cond = frigate_node(serde_json::json!({"on_unavailable": "treat_as_match"}));
        assert!(eval_condition_with_context(&cond, &state(&[]), now, &sources));

        let cond = frigate_node(serde_json::json!({"on_unavailable": "treat_as_no_match"}));
        assert!(!eval_condition_with_context(&cond, &state(&[]), now, &sources));

        // Default policy is treat_as_no_match.
        let cond = frigate_node(serde_json::json!({}));
        assert!(!eval_condition_with_context(&cond, &state(&[]), now, &sources));
    }

    #[test]
    fn test_frigate_available_but_empty_is_no_match() {
        let now = Utc::now();
        let sources = StubSources::new();
        let cond = frigate_node(serde_json::json!({"on_unavailable": "treat_as_match"}));
        assert!(!eval_condition_with_context(&cond, &state(&[]), now, &sources));
    }

    #[test]
    fn test_frigate_percentile_aggregation() {
        let now = Utc::now();
        let mut sources = StubSources::new();
        sources.detections = (1..=5)
            .map(|i| detection("driveway", &[], (i * 10) as f64, now - chrono::Duration::seconds(i)))
            .collect();
        // Sorted scores [10,20,30,40,50], p=60 → rank 3 → 30.
        let cond = frigate_node(serde_json::json!({
            "aggregation": "percentile", "percentile": 60, "min_confidence_pct": 30
        }));
        assert!(eval_condition_with_context(&cond, &state(&[]), now, &sources));

        let cond = frigate_node(serde_json::json!({
            "aggregation": "percentile", "percentile": 60, "min_confidence_pct": 31
        }));
        assert!(!eval_condition_with_context(&cond, &state(&[]), now, &sources));

        // Missing percentile never matches, even with candidates present.
        let cond = frigate_node(serde_json::json!({"aggregation": "percentile"}));
        assert!(!eval_condition_with_context(&cond, &state(&[]), now, &sources));
    }

    #[test]
    fn test_nearest_rank_percentile() {
        let scores = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(nearest_rank_percentile(&scores, 60), Some(30.0));
        assert_eq!(nearest_rank_percentile(&scores, 1), Some(10.0));
        assert_eq!(nearest_rank_percentile(&scores, 100), Some(50.0));
        assert_eq!(nearest_rank_percentile(&[], 50), None);
        assert_eq!(nearest_rank_percentile(&scores, 0), None);
        assert_eq!(nearest_rank_percentile(&scores, 101), None);
    }
}
