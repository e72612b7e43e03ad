//! Admin write path for rules and runtime state.
//!
//! The REST layer calls into these on rule create/update/delete and on the
//! suspended-rules endpoints. Every rule write re-derives the entity
//! references from the condition tree and invalidates the reverse index so
//! all dispatcher processes rebuild on their next lookup.

use thiserror::Error;
use tracing::info;

use latch_core::LatchError;
use latch_rules::extractor::extract_entity_ids;
use latch_rules::repository::{DispatchRepos, EngineRepos};
use latch_rules::schema::{Rule, RuleRuntimeState};
use latch_rules::validation::{validate_rule, ValidationResult};

use crate::failure::clear_suspension;
use crate::index::EntityRuleIndex;

/// Failure modes of the rule write path.
#[derive(Debug, Error)]
pub enum RuleSaveError {
    #[error("rule validation failed")]
    Invalid(ValidationResult),

    #[error(transparent)]
    Repo(#[from] LatchError),
}

/// Validate and persist a rule, refreshing its entity references.
pub async fn save_rule(
    repos: &dyn DispatchRepos,
    index: &EntityRuleIndex,
    rule: Rule,
    actor_is_admin: bool,
) -> Result<Rule, RuleSaveError> {
    let validation = validate_rule(&rule, actor_is_admin);
    if !validation.valid {
        return Err(RuleSaveError::Invalid(validation));
    }

    let entity_ids = extract_entity_ids(&rule.definition);
    repos.upsert_rule(rule.clone()).await?;
    repos.replace_entity_refs(rule.id, &entity_ids).await?;
    index.invalidate().await;

    info!(
        rule_id = rule.id,
        rule_name = %rule.name,
        entity_refs = entity_ids.len(),
        "rule saved"
    );
    Ok(rule)
}

/// Delete a rule and invalidate the reverse index.
pub async fn delete_rule(
    repos: &dyn DispatchRepos,
    index: &EntityRuleIndex,
    rule_id: i64,
) -> Result<(), LatchError> {
    repos.delete_rule(rule_id).await?;
    index.invalidate().await;
    info!(rule_id, "rule deleted");
    Ok(())
}

/// Runtimes currently suspended by the circuit breaker.
pub async fn list_suspended(
    repos: &dyn DispatchRepos,
) -> Result<Vec<RuleRuntimeState>, LatchError> {
    let runtimes = repos.list_runtimes().await?;
    Ok(runtimes
        .into_iter()
        .filter(|rt| rt.error_suspended)
        .collect())
}

/// Force-clear a rule's suspension; equivalent to recording a success.
///
/// Returns `false` when the rule does not exist.
pub async fn clear_rule_suspension(
    repos: &dyn DispatchRepos,
    rule_id: i64,
) -> Result<bool, LatchError> {
    let Some(rule) = repos.get_rule(rule_id).await? else {
        return Ok(false);
    };
    let mut runtime = repos.ensure_runtime(&rule).await?;
    clear_suspension(&mut runtime);
    repos.save_runtime(&runtime).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::record_rule_failure;
    use latch_core::{MemoryKv, SYSTEM_ALARM_STATE_ENTITY_ID};
    use latch_rules::repository::MemoryRepos;
    use latch_rules::schema::{RuleDefinition, RuleKind};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn rule(id: i64, when: serde_json::Value, then: serde_json::Value) -> Rule {
        Rule {
            id,
            name: format!("rule-{id}"),
            kind: RuleKind::Trigger,
            enabled: true,
            priority: 0,
            cooldown_seconds: None,
            definition: RuleDefinition {
                when: serde_json::from_value(when).ok(),
                then: serde_json::from_value(then).unwrap(),
            },
            schema_version: 1,
        }
    }

    fn fixture() -> (MemoryRepos, EntityRuleIndex) {
        (MemoryRepos::new(), EntityRuleIndex::new(Arc::new(MemoryKv::new())))
    }

    #[tokio::test]
    async fn test_save_derives_entity_refs() {
        let (repos, index) = fixture();
        let saved = save_rule(
            &repos,
            &index,
            rule(
                1,
                serde_json::json!({
                    "op": "all",
                    "children": [
                        {"op": "entity_state", "entity_id": "door", "equals": "on"},
                        {"op": "alarm_state_in", "states": ["armed_home"]}
                    ]
                }),
                serde_json::json!([{"type": "alarm_trigger"}]),
            ),
            false,
        )
        .await
        .unwrap();
        assert_eq!(saved.id, 1);

        let refs = repos.entity_rule_refs().await.unwrap();
        assert_eq!(
            refs,
            vec![
                (SYSTEM_ALARM_STATE_ENTITY_ID.to_string(), 1),
                ("door".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn test_save_invalidates_index() {
        let (repos, index) = fixture();
        let entity_ids = BTreeSet::from(["door".to_string()]);

        // Warm the cache with no rules.
        let found = index.rule_ids_for(&entity_ids, &repos).await.unwrap();
        assert!(found.is_empty());

        save_rule(
            &repos,
            &index,
            rule(
                1,
                serde_json::json!({"op": "entity_state", "entity_id": "door", "equals": "on"}),
                serde_json::json!([{"type": "alarm_trigger"}]),
            ),
            false,
        )
        .await
        .unwrap();

        // The save bumped the version, so the next lookup sees the rule.
        let found = index.rule_ids_for(&entity_ids, &repos).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_save_update_replaces_refs() {
        let (repos, index) = fixture();
        save_rule(
            &repos,
            &index,
            rule(
                1,
                serde_json::json!({"op": "entity_state", "entity_id": "door", "equals": "on"}),
                serde_json::json!([{"type": "alarm_trigger"}]),
            ),
            false,
        )
        .await
        .unwrap();
        save_rule(
            &repos,
            &index,
            rule(
                1,
                serde_json::json!({"op": "entity_state", "entity_id": "window", "equals": "on"}),
                serde_json::json!([{"type": "alarm_trigger"}]),
            ),
            false,
        )
        .await
        .unwrap();

        let refs = repos.entity_rule_refs().await.unwrap();
        assert_eq!(refs, vec![("window".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_invalid_rule_rejected() {
        let (repos, index) = fixture();
        let result = save_rule(
            &repos,
            &index,
            rule(
                1,
                serde_json::json!({"op": "all", "children": []}),
                serde_json::json!([]),
            ),
            false,
        )
        .await;
        assert!(matches!(result, Err(RuleSaveError::Invalid(_))));
        assert!(repos.get_rule(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_admin_cannot_save_integration_actions() {
        let (repos, index) = fixture();
        let attempted = rule(
            1,
            serde_json::json!({"op": "entity_state", "entity_id": "door", "equals": "on"}),
            serde_json::json!([{"type": "zigbee2mqtt_switch", "entity_id": "siren", "state": "on"}]),
        );
        let result = save_rule(&repos, &index, attempted.clone(), false).await;
        assert!(matches!(result, Err(RuleSaveError::Invalid(_))));

        save_rule(&repos, &index, attempted, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_rule_drops_refs() {
        let (repos, index) = fixture();
        save_rule(
            &repos,
            &index,
            rule(
                1,
                serde_json::json!({"op": "entity_state", "entity_id": "door", "equals": "on"}),
                serde_json::json!([{"type": "alarm_trigger"}]),
            ),
            false,
        )
        .await
        .unwrap();

        delete_rule(&repos, &index, 1).await.unwrap();
        assert!(repos.get_rule(1).await.unwrap().is_none());
        assert!(repos.entity_rule_refs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suspension_listing_and_clear() {
        let (repos, index) = fixture();
        let r = rule(
            1,
            serde_json::json!({"op": "entity_state", "entity_id": "door", "equals": "on"}),
            serde_json::json!([{"type": "alarm_trigger"}]),
        );
        save_rule(&repos, &index, r.clone(), false).await.unwrap();

        let now = chrono::Utc::now();
        let mut runtime = repos.ensure_runtime(&r).await.unwrap();
        for _ in 0..10 {
            record_rule_failure(&r, &mut runtime, "boom", now);
        }
        repos.save_runtime(&runtime).await.unwrap();

        let suspended = list_suspended(&repos).await.unwrap();
        assert_eq!(suspended.len(), 1);
        assert_eq!(suspended[0].rule_id, 1);

        assert!(clear_rule_suspension(&repos, 1).await.unwrap());
        assert!(list_suspended(&repos).await.unwrap().is_empty());

        assert!(!clear_rule_suspension(&repos, 404).await.unwrap());
    }
}
