//! THEN-action execution.
//!
//! Runs a rule's action list in order against the gateway contracts and
//! produces an audit-friendly result. Per-action failures are accumulated,
//! never abort the list, and surface through the circuit breaker via the
//! `errors` vector. Only an unreadable alarm snapshot fails the whole pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use latch_core::LatchError;

use crate::gateways::{
    AlarmServices, GatewayError, HomeAssistantGateway, NotificationDispatcher, Zigbee2mqttGateway,
    ZwavejsGateway,
};
use crate::schema::{Action, Rule};

/// Default timeout for Home Assistant service calls.
const HA_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a single action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub ok: bool,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Action-specific echo fields (entity_id, mode, ...).
    #[serde(flatten)]
    pub detail: Map<String, JsonValue>,
}

impl ActionOutcome {
    fn ok(action_type: &str, detail: JsonValue) -> Self {
        Self {
            ok: true,
            action_type: action_type.to_string(),
            error: None,
            detail: as_map(detail),
        }
    }

    fn failed(action_type: &str, error: impl Into<String>, detail: JsonValue) -> Self {
        Self {
            ok: false,
            action_type: action_type.to_string(),
            error: Some(error.into()),
            detail: as_map(detail),
        }
    }
}

fn as_map(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

/// Result of one execution pass over a rule's action list.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub alarm_state_before: Option<String>,
    pub alarm_state_after: Option<String>,
    pub actions: Vec<ActionOutcome>,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Dispatches actions to their gateway handlers.
pub struct ActionExecutor {
    alarm: Arc<dyn AlarmServices>,
    home_assistant: Arc<dyn HomeAssistantGateway>,
    zwavejs: Arc<dyn ZwavejsGateway>,
    zigbee2mqtt: Arc<dyn Zigbee2mqttGateway>,
    notifications: Arc<dyn NotificationDispatcher>,
    ha_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        alarm: Arc<dyn AlarmServices>,
        home_assistant: Arc<dyn HomeAssistantGateway>,
        zwavejs: Arc<dyn ZwavejsGateway>,
        zigbee2mqtt: Arc<dyn Zigbee2mqttGateway>,
        notifications: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            alarm,
            home_assistant,
            zwavejs,
            zigbee2mqtt,
            notifications,
            ha_timeout: HA_CALL_TIMEOUT,
        }
    }

    /// Execute `actions` in list order on behalf of `rule`.
    ///
    /// The alarm snapshot is read immediately before and after the batch to
    /// capture the state transition. Errors from individual actions land in
    /// the result; only snapshot failures propagate.
    pub async fn execute(
        &self,
        rule: &Rule,
        actions: &[Action],
        now: DateTime<Utc>,
    ) -> Result<ExecutionResult, LatchError> {
        let before = self
            .alarm
            .current_snapshot(true)
            .await
            .map_err(|e| LatchError::Other(format!("alarm snapshot failed: {e}")))?;

        let mut outcomes: Vec<ActionOutcome> = Vec::with_capacity(actions.len());
        let mut errors: Vec<String> = Vec::new();
        let reason = format!("rule:{}", rule.id);

        for action in actions {
            let outcome = self.run_action(rule, action, &reason).await;
            if let Some(error) = &outcome.error {
                if outcome.action_type != "unsupported" {
                    errors.push(error.clone());
                }
            }
            outcomes.push(outcome);
        }

        let after = self
            .alarm
            .current_snapshot(true)
            .await
            .map_err(|e| LatchError::Other(format!("alarm snapshot failed: {e}")))?;

        debug!(
            rule_id = rule.id,
            actions = outcomes.len(),
            errors = errors.len(),
            "executed rule actions"
        );

        Ok(ExecutionResult {
            alarm_state_before: Some(before.current_state),
            alarm_state_after: Some(after.current_state),
            actions: outcomes,
            errors,
            timestamp: now,
        })
    }

    async fn run_action(&self, rule: &Rule, action: &Action, reason: &str) -> ActionOutcome {
        let kind = action.type_name();
        match action {
            Action::AlarmTrigger => match self.alarm.trigger(reason).await {
                Ok(()) => ActionOutcome::ok(kind, json!({})),
                Err(e) => ActionOutcome::failed(kind, e.to_string(), json!({})),
            },
            Action::AlarmDisarm => match self.alarm.disarm(reason).await {
                Ok(()) => ActionOutcome::ok(kind, json!({})),
                Err(e) => ActionOutcome::failed(kind, e.to_string(), json!({})),
            },
            Action::AlarmArm { mode } => match self.alarm.arm(mode, reason).await {
                Ok(()) => ActionOutcome::ok(kind, json!({"mode": mode})),
                Err(e) => ActionOutcome::failed(kind, e.to_string(), json!({"mode": mode})),
            },
            Action::HaCallService {
                action: service_pair,
                target,
                data,
            } => {
                let Some((domain, service)) = service_pair
                    .split_once('.')
                    .filter(|(d, s)| !d.is_empty() && !s.is_empty())
                else {
                    return ActionOutcome::failed(kind, "invalid_action_format", json!({}));
                };
                match self
                    .home_assistant
                    .call_service(domain, service, target.as_ref(), data.as_ref(), self.ha_timeout)
                    .await
                {
                    Ok(()) => ActionOutcome::ok(kind, json!({"action": service_pair})),
                    Err(e) => {
                        ActionOutcome::failed(kind, e.to_string(), json!({"action": service_pair}))
                    }
                }
            }
            Action::ZwavejsSetValue {
                node_id,
                value_id,
                value,
            } => {
                let detail = json!({"node_id": node_id, "value_id": value_id});
                let endpoint = value_id.endpoint.unwrap_or(0);
                match self
                    .zwavejs
                    .set_value(
                        *node_id,
                        endpoint,
                        value_id.command_class,
                        &value_id.property,
                        value_id.property_key.as_ref(),
                        value,
                    )
                    .await
                {
                    Ok(()) => ActionOutcome::ok(kind, detail),
                    Err(e) => ActionOutcome::failed(kind, e.to_string(), detail),
                }
            }
            Action::Zigbee2mqttSetValue { entity_id, value } => {
                let entity_id = entity_id.trim();
                match self.zigbee2mqtt.set_entity_value(entity_id, value).await {
                    Ok(()) => ActionOutcome::ok(kind, json!({"entity_id": entity_id})),
                    Err(e) => {
                        ActionOutcome::failed(kind, e.to_string(), json!({"entity_id": entity_id}))
                    }
                }
            }
            Action::Zigbee2mqttSwitch { entity_id, state } => {
                let entity_id = entity_id.trim();
                let detail = json!({"entity_id": entity_id, "state": state.as_str()});
                let payload = json!({"state": state.is_on()});
                match self.zigbee2mqtt.set_entity_value(entity_id, &payload).await {
                    Ok(()) => ActionOutcome::ok(kind, detail),
                    Err(e) => ActionOutcome::failed(kind, e.to_string(), detail),
                }
            }
            Action::Zigbee2mqttLight {
                entity_id,
                state,
                brightness,
            } => {
                let entity_id = entity_id.trim();
                let mut detail = json!({"entity_id": entity_id, "state": state.as_str()});
                let mut payload = json!({"state": state.is_on()});
                if let Some(brightness) = brightness {
                    detail["brightness"] = json!(brightness);
                    payload["brightness"] = json!(brightness);
                }
                match self.zigbee2mqtt.set_entity_value(entity_id, &payload).await {
                    Ok(()) => ActionOutcome::ok(kind, detail),
                    Err(e) => ActionOutcome::failed(kind, e.to_string(), detail),
                }
            }
            Action::SendNotification {
                provider_id,
                message,
                title,
                data,
            } => {
                match self
                    .notifications
                    .enqueue(provider_id, message, title.as_deref(), data.as_ref(), &rule.name)
                    .await
                {
                    Ok(receipt) => ActionOutcome::ok(
                        kind,
                        json!({
                            "provider_id": provider_id,
                            "delivery_id": receipt.delivery_id,
                            "queued": receipt.queued,
                        }),
                    ),
                    Err(e) => ActionOutcome::failed(
                        kind,
                        e.to_string(),
                        json!({"provider_id": provider_id}),
                    ),
                }
            }
            Action::Unsupported => {
                ActionOutcome::failed(kind, "unsupported_action", json!({}))
            }
        }
    }
}
