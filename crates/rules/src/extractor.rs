//! Entity-id extraction from condition trees.
//!
//! The dispatcher's reverse index maps `entity_id → rule ids`; this module
//! derives the entity ids a rule depends on. Extraction is pure and stable:
//! the same tree always yields the same set, and the set is exactly what
//! gets persisted as the rule's entity references on every save.

use std::collections::BTreeSet;

use latch_core::SYSTEM_ALARM_STATE_ENTITY_ID;

use crate::schema::{ConditionNode, RuleDefinition};

/// Collect every entity id a rule definition references.
///
/// `alarm_state_in` contributes the synthetic
/// [`SYSTEM_ALARM_STATE_ENTITY_ID`]: the alarm-state broadcaster notifies
/// the dispatcher under that id, so indexing it here is what makes
/// alarm-state rules re-evaluate on transitions. Detection and time
/// predicates reference no entities.
pub fn extract_entity_ids(definition: &RuleDefinition) -> BTreeSet<String> {
    let mut entity_ids = BTreeSet::new();
    if let Some(when) = &definition.when {
        collect(when, &mut entity_ids);
    }
    entity_ids
}

fn collect(node: &ConditionNode, entity_ids: &mut BTreeSet<String>) {
    match node {
        ConditionNode::EntityState { entity_id, .. } => {
            let trimmed = entity_id.trim();
            if !trimmed.is_empty() {
                entity_ids.insert(trimmed.to_string());
            }
        }
        ConditionNode::AlarmStateIn { .. } => {
            entity_ids.insert(SYSTEM_ALARM_STATE_ENTITY_ID.to_string());
        }
        ConditionNode::All { children } | ConditionNode::Any { children } => {
            for child in children {
                collect(child, entity_ids);
            }
        }
        ConditionNode::Not { child } | ConditionNode::For { child, .. } => {
            collect(child, entity_ids);
        }
        ConditionNode::TimeInRange { .. } | ConditionNode::FrigatePersonDetected { .. } => {}
    }
}
