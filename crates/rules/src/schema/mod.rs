//! Rule document schema and runtime-state types.
//!
//! Defines the persisted rule shape (`Rule`, `RuleDefinition`) plus the
//! per-rule scheduling/health row (`RuleRuntimeState`) the engine and the
//! failure handler cooperate on. Condition and action trees live in their
//! own submodules.

mod action;
mod condition;

pub use action::*;
pub use condition::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a rule is for; drives audit labelling, not evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Trigger,
    Arm,
    Disarm,
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleKind::Trigger => write!(f, "trigger"),
            RuleKind::Arm => write!(f, "arm"),
            RuleKind::Disarm => write!(f, "disarm"),
        }
    }
}

/// The WHEN/THEN payload of a rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Condition tree; a rule without one never matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<ConditionNode>,
    /// Ordered actions executed when the rule fires.
    #[serde(default)]
    pub then: Vec<Action>,
}

/// A user-authored automation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub kind: RuleKind,
    pub enabled: bool,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<i64>,
    pub definition: RuleDefinition,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

/// Runtime status of a rule's `when` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Pending,
    ErrorSuspended,
}

/// Per-rule scheduling and health state, auto-created on first evaluation.
///
/// `scheduled_for`/`became_true_at` implement `for`-delay continuity;
/// the failure fields belong to the circuit breaker. Invariant:
/// `consecutive_failures == 0` iff `error_suspended == false` and
/// `next_allowed_at == None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRuntimeState {
    pub rule_id: i64,
    /// Node the state is tracking; currently always the root `when`.
    pub node_id: String,
    pub status: RuntimeStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub became_true_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: String,
    pub next_allowed_at: Option<DateTime<Utc>>,
    pub error_suspended: bool,
    pub updated_at: DateTime<Utc>,
}

impl RuleRuntimeState {
    /// Fresh pending state for a rule's `when` node.
    pub fn new(rule_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            rule_id,
            node_id: "when".to_string(),
            status: RuntimeStatus::Pending,
            scheduled_for: None,
            became_true_at: None,
            last_fired_at: None,
            consecutive_failures: 0,
            last_failure_at: None,
            last_error: String::new(),
            next_allowed_at: None,
            error_suspended: false,
            updated_at: now,
        }
    }
}

/// Whether an audit row came from an entity-change dispatch or a timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Immediate,
    Timer,
}

/// Audit trace attached to each action-log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTrace {
    pub source: TriggerSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn door_rule_json() -> &'static str {
        r#"{
            "id": 7,
            "name": "door opens while armed",
            "kind": "trigger",
            "enabled": true,
            "priority": 10,
            "cooldown_seconds": 30,
            "definition": {
                "when": {
                    "op": "all",
                    "children": [
                        {"op": "entity_state", "entity_id": "binary_sensor.front_door", "equals": "on"},
                        {"op": "alarm_state_in", "states": ["armed_home", "armed_away"]}
                    ]
                },
                "then": [{"type": "alarm_trigger"}]
            },
            "schema_version": 1
        }"#
    }

    #[test]
    fn test_rule_document_round_trip() {
        let rule: Rule = serde_json::from_str(door_rule_json()).unwrap();
        assert_eq!(rule.kind, RuleKind::Trigger);
        assert_eq!(rule.cooldown_seconds, Some(30));
        assert_eq!(rule.definition.then.len(), 1);
        assert!(matches!(
            rule.definition.when,
            Some(ConditionNode::All { .. })
        ));

        let json = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_schema_version_defaults_to_one() {
        let rule: Rule = serde_json::from_str(
            r#"{"id":1,"name":"r","kind":"arm","enabled":true,"priority":0,"definition":{}}"#,
        )
        .unwrap();
        assert_eq!(rule.schema_version, 1);
        assert!(rule.definition.when.is_none());
        assert!(rule.definition.then.is_empty());
    }

    #[test]
    fn test_runtime_state_starts_pending() {
        let now = Utc::now();
        let runtime = RuleRuntimeState::new(7, now);
        assert_eq!(runtime.node_id, "when");
        assert_eq!(runtime.status, RuntimeStatus::Pending);
        assert_eq!(runtime.consecutive_failures, 0);
        assert!(!runtime.error_suspended);
        assert!(runtime.next_allowed_at.is_none());
    }

    #[test]
    fn test_trigger_trace_wire_format() {
        let trace = TriggerTrace {
            source: TriggerSource::Immediate,
        };
        assert_eq!(
            serde_json::to_value(trace).unwrap(),
            serde_json::json!({"source": "immediate"})
        );
    }
}
