//! Save-time rule validation with structured, path-addressed errors.
//!
//! Validates the WHEN condition tree and the THEN action list before a rule
//! is persisted. Errors block the save; warnings are advisory. Anything
//! that passes here is safe for the evaluator. The evaluator still treats
//! semantically broken nodes as false, but only trees that bypassed
//! validation can reach that path.

use serde::{Deserialize, Serialize};

use crate::schema::{
    normalize_days, parse_hhmm, resolve_zone, Action, Aggregation, ConditionNode, Rule,
    ARMED_MODES,
};

// ── Result types ────────────────────────────────────────────────────

/// Overall validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

/// A blocking validation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    /// JSON-path-like location, e.g. `"when.children[1].seconds"`.
    pub path: String,
    pub message: String,
}

/// A non-blocking advisory warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(ValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationWarning {
            path: path.into(),
            message: message.into(),
        });
    }
}

// ── Rule-level validation ───────────────────────────────────────────

/// Validate a complete rule document for the given author.
pub fn validate_rule(rule: &Rule, actor_is_admin: bool) -> ValidationResult {
    let mut result = ValidationResult::new();

    if rule.schema_version != 1 {
        result.error(
            "schema_version",
            format!("unsupported schema_version: {}", rule.schema_version),
        );
    }
    if rule.name.trim().is_empty() {
        result.error("name", "required");
    }
    if let Some(cooldown) = rule.cooldown_seconds {
        if cooldown < 0 {
            result.error("cooldown_seconds", "must not be negative");
        }
    }

    validate_when_into(rule.definition.when.as_ref(), &mut result);

    if rule.definition.then.is_empty() {
        result.warn("definition.then", "rule has no actions and will never do anything");
    }
    for (idx, action) in rule.definition.then.iter().enumerate() {
        validate_action_into(action, actor_is_admin, &format!("definition.then[{idx}]"), &mut result);
    }

    result
}

/// Validate just a WHEN condition tree (`None`/absent is valid: never matches).
pub fn validate_when(node: Option<&ConditionNode>) -> ValidationResult {
    let mut result = ValidationResult::new();
    validate_when_into(node, &mut result);
    result
}

fn validate_when_into(node: Option<&ConditionNode>, result: &mut ValidationResult) {
    let Some(node) = node else {
        return;
    };
    let errors_before = result.errors.len();
    validate_node(node, "when", true, result);

    // Guardrail: time-only rules won't fire without a time-based dispatcher.
    let tree_is_clean = result.errors.len() == errors_before;
    if tree_is_clean && has_time_in_range(node) && !has_triggerable_condition(node) {
        result.error(
            "when",
            "time_in_range must be combined with at least one entity/alarm/frigate condition",
        );
    }
}

fn validate_node(node: &ConditionNode, path: &str, is_root: bool, result: &mut ValidationResult) {
    match node {
        ConditionNode::All { children } | ConditionNode::Any { children } => {
            if children.is_empty() {
                result.error(format!("{path}.children"), "must be a non-empty list");
            }
            for (idx, child) in children.iter().enumerate() {
                validate_node(child, &format!("{path}.children[{idx}]"), false, result);
            }
        }
        ConditionNode::Not { child } => {
            validate_node(child, &format!("{path}.child"), false, result);
        }
        ConditionNode::For { seconds, child } => {
            if !is_root {
                result.error(path, "for is only allowed at the root of the condition tree");
            }
            if *seconds <= 0 {
                result.error(format!("{path}.seconds"), "must be a positive integer");
            }
            validate_node(child, &format!("{path}.child"), false, result);
        }
        ConditionNode::EntityState { entity_id, equals } => {
            if entity_id.trim().is_empty() {
                result.error(format!("{path}.entity_id"), "required");
            }
            if equals.trim().is_empty() {
                result.error(format!("{path}.equals"), "required");
            }
        }
        ConditionNode::AlarmStateIn { states } => {
            if !states.iter().any(|s| !s.trim().is_empty()) {
                result.error(format!("{path}.states"), "must be a non-empty list of states");
            }
        }
        ConditionNode::TimeInRange {
            start,
            end,
            days,
            tz,
        } => {
            let start_min = parse_hhmm(start);
            let end_min = parse_hhmm(end);
            if start_min.is_none() {
                result.error(format!("{path}.start"), "must be HH:MM (24-hour)");
            }
            if end_min.is_none() {
                result.error(format!("{path}.end"), "must be HH:MM (24-hour)");
            }
            if let (Some(s), Some(e)) = (start_min, end_min) {
                if s == e {
                    result.error(format!("{path}.end"), "must not equal start");
                }
            }
            if let Err(err) = normalize_days(days.as_deref()) {
                result.error(format!("{path}.days"), err);
            }
            if let Err(err) = resolve_zone(tz.as_deref()) {
                result.error(format!("{path}.tz"), err);
            }
        }
        ConditionNode::FrigatePersonDetected {
            cameras,
            within_seconds,
            min_confidence_pct,
            aggregation,
            percentile,
            ..
        } => {
            if !cameras.iter().any(|c| !c.trim().is_empty()) {
                result.error(
                    format!("{path}.cameras"),
                    "must be a non-empty list of camera names",
                );
            }
            if *within_seconds <= 0 {
                result.error(format!("{path}.within_seconds"), "must be a positive integer");
            }
            if !(0.0..=100.0).contains(min_confidence_pct) {
                result.error(
                    format!("{path}.min_confidence_pct"),
                    "must be between 0 and 100",
                );
            }
            match (aggregation, percentile) {
                (Aggregation::Percentile, None) => {
                    result.error(
                        format!("{path}.percentile"),
                        "required when aggregation is percentile",
                    );
                }
                (Aggregation::Percentile, Some(p)) if !(1..=100).contains(p) => {
                    result.error(format!("{path}.percentile"), "must be between 1 and 100");
                }
                (Aggregation::Percentile, Some(_)) => {}
                (_, Some(_)) => {
                    result.warn(
                        format!("{path}.percentile"),
                        "ignored unless aggregation is percentile",
                    );
                }
                (_, None) => {}
            }
        }
    }
}

// ── Action validation ───────────────────────────────────────────────

fn validate_action_into(
    action: &Action,
    actor_is_admin: bool,
    path: &str,
    result: &mut ValidationResult,
) {
    if action.admin_only() && !actor_is_admin {
        result.error(
            path,
            format!("{} requires admin privileges", action.type_name()),
        );
    }

    match action {
        Action::AlarmTrigger | Action::AlarmDisarm => {}
        Action::AlarmArm { mode } => {
            if !ARMED_MODES.contains(&mode.as_str()) {
                result.error(
                    format!("{path}.mode"),
                    format!("invalid mode '{mode}'; must be one of: {}", ARMED_MODES.join(", ")),
                );
            }
        }
        Action::HaCallService {
            action: service,
            target,
            data,
        } => {
            let valid_pair = service
                .split_once('.')
                .is_some_and(|(domain, svc)| !domain.is_empty() && !svc.is_empty());
            if !valid_pair {
                result.error(
                    format!("{path}.action"),
                    "must be in domain.service format (e.g. 'light.turn_on')",
                );
            }
            if target.as_ref().is_some_and(|t| !t.is_object()) {
                result.error(format!("{path}.target"), "must be an object if provided");
            }
            if data.as_ref().is_some_and(|d| !d.is_object()) {
                result.error(format!("{path}.data"), "must be an object if provided");
            }
        }
        Action::ZwavejsSetValue { value_id, .. } => {
            if !(value_id.property.is_string() || value_id.property.is_i64() || value_id.property.is_u64()) {
                result.error(
                    format!("{path}.value_id.property"),
                    "must be a string or integer",
                );
            }
            if value_id
                .property_key
                .as_ref()
                .is_some_and(|k| !(k.is_string() || k.is_i64() || k.is_u64()))
            {
                result.error(
                    format!("{path}.value_id.propertyKey"),
                    "must be a string or integer if provided",
                );
            }
        }
        Action::Zigbee2mqttSetValue { entity_id, .. }
        | Action::Zigbee2mqttSwitch { entity_id, .. } => {
            if entity_id.trim().is_empty() {
                result.error(format!("{path}.entity_id"), "required");
            }
        }
        Action::Zigbee2mqttLight {
            entity_id,
            brightness,
            ..
        } => {
            if entity_id.trim().is_empty() {
                result.error(format!("{path}.entity_id"), "required");
            }
            if brightness.is_some_and(|b| !(0..=255).contains(&b)) {
                result.error(format!("{path}.brightness"), "must be between 0 and 255");
            }
        }
        Action::SendNotification {
            provider_id,
            message,
            ..
        } => {
            if provider_id.trim().is_empty() {
                result.error(format!("{path}.provider_id"), "required");
            }
            if message.trim().is_empty() {
                result.error(format!("{path}.message"), "required");
            }
        }
        Action::Unsupported => {
            result.error(path, "unsupported action type");
        }
    }
}

// ── Tree inspection helpers ─────────────────────────────────────────

fn has_time_in_range(node: &ConditionNode) -> bool {
    match node {
        ConditionNode::TimeInRange { .. } => true,
        ConditionNode::All { children } | ConditionNode::Any { children } => {
            children.iter().any(has_time_in_range)
        }
        ConditionNode::Not { child } | ConditionNode::For { child, .. } => {
            has_time_in_range(child)
        }
        _ => false,
    }
}

fn has_triggerable_condition(node: &ConditionNode) -> bool {
    match node {
        ConditionNode::EntityState { .. }
        | ConditionNode::AlarmStateIn { .. }
        | ConditionNode::FrigatePersonDetected { .. } => true,
        ConditionNode::TimeInRange { .. } => false,
        ConditionNode::All { children } | ConditionNode::Any { children } => {
            children.iter().any(has_triggerable_condition)
        }
        ConditionNode::Not { child } | ConditionNode::For { child, .. } => {
            has_triggerable_condition(child)
        }
    }
}
