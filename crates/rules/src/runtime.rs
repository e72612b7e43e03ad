//! Runtime-state helpers shared by the engine and the dispatcher.

use chrono::{DateTime, Utc};

use crate::schema::{Rule, RuleRuntimeState};

/// Whether a rule is still inside its cooldown window.
pub fn cooldown_active(rule: &Rule, runtime: &RuleRuntimeState, now: DateTime<Utc>) -> bool {
    let Some(cooldown_seconds) = rule.cooldown_seconds.filter(|c| *c > 0) else {
        return false;
    };
    let Some(last_fired_at) = runtime.last_fired_at else {
        return false;
    };
    (now - last_fired_at).num_seconds() < cooldown_seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RuleDefinition, RuleKind};

    fn rule(cooldown_seconds: Option<i64>) -> Rule {
        Rule {
            id: 1,
            name: "r".to_string(),
            kind: RuleKind::Trigger,
            enabled: true,
            priority: 0,
            cooldown_seconds,
            definition: RuleDefinition::default(),
            schema_version: 1,
        }
    }

    #[test]
    fn test_no_cooldown_configured() {
        let now = Utc::now();
        let mut runtime = RuleRuntimeState::new(1, now);
        runtime.last_fired_at = Some(now);
        assert!(!cooldown_active(&rule(None), &runtime, now));
        assert!(!cooldown_active(&rule(Some(0)), &runtime, now));
    }

    #[test]
    fn test_never_fired_is_not_cooling() {
        let now = Utc::now();
        let runtime = RuleRuntimeState::new(1, now);
        assert!(!cooldown_active(&rule(Some(60)), &runtime, now));
    }

    #[test]
    fn test_cooldown_window() {
        let now = Utc::now();
        let mut runtime = RuleRuntimeState::new(1, now);
        runtime.last_fired_at = Some(now - chrono::Duration::seconds(30));
        assert!(cooldown_active(&rule(Some(60)), &runtime, now));

        runtime.last_fired_at = Some(now - chrono::Duration::seconds(60));
        assert!(!cooldown_active(&rule(Some(60)), &runtime, now));
    }
}
