//! Outbound gateway contracts.
//!
//! The engine never talks to an integration directly; every outbound call
//! goes through one of these traits. Real implementations (HTTP client for
//! Home Assistant, MQTT sessions, the notification pipeline) live outside
//! this workspace; tests use in-crate mocks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Typed failure surface for all integration calls.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("not reachable: {0}")]
    NotReachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Point-in-time view of the alarm state machine.
#[derive(Debug, Clone)]
pub struct AlarmSnapshot {
    pub current_state: String,
}

/// Alarm state-machine operations.
#[async_trait]
pub trait AlarmServices: Send + Sync {
    /// Current snapshot; `process_timers` advances pending exit/entry
    /// delays before reading.
    async fn current_snapshot(&self, process_timers: bool) -> Result<AlarmSnapshot, GatewayError>;

    async fn arm(&self, target_state: &str, reason: &str) -> Result<(), GatewayError>;

    async fn disarm(&self, reason: &str) -> Result<(), GatewayError>;

    async fn trigger(&self, reason: &str) -> Result<(), GatewayError>;

    async fn cancel_arming(&self, reason: &str) -> Result<(), GatewayError>;
}

/// Home Assistant service invocation.
#[async_trait]
pub trait HomeAssistantGateway: Send + Sync {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        target: Option<&JsonValue>,
        data: Option<&JsonValue>,
        timeout: Duration,
    ) -> Result<(), GatewayError>;
}

/// Z-Wave JS value write.
#[async_trait]
pub trait ZwavejsGateway: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn set_value(
        &self,
        node_id: i64,
        endpoint: i64,
        command_class: i64,
        property: &JsonValue,
        property_key: Option<&JsonValue>,
        value: &JsonValue,
    ) -> Result<(), GatewayError>;
}

/// Zigbee2MQTT entity write.
#[async_trait]
pub trait Zigbee2mqttGateway: Send + Sync {
    async fn set_entity_value(&self, entity_id: &str, value: &JsonValue)
        -> Result<(), GatewayError>;
}

/// Raw MQTT publish, used by broker-backed gateway implementations.
#[async_trait]
pub trait MqttGateway: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), GatewayError>;
}

/// Outcome of queueing a notification for delivery.
#[derive(Debug, Clone)]
pub struct NotificationReceipt {
    pub delivery_id: String,
    pub queued: bool,
}

/// Notification pipeline entry point.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn enqueue(
        &self,
        provider_id: &str,
        message: &str,
        title: Option<&str>,
        data: Option<&JsonValue>,
        rule_name: &str,
    ) -> Result<NotificationReceipt, GatewayError>;
}

/// Zigbee2MQTT gateway over a raw MQTT session.
///
/// Publishes set payloads to `<base_topic>/<entity_id>/set` with QoS 0,
/// no retain. Non-object values are wrapped as `{"state": value}` the way
/// the bridge expects for bare writes.
pub struct Zigbee2mqttOverMqtt<M> {
    mqtt: M,
    base_topic: String,
}

impl<M: MqttGateway> Zigbee2mqttOverMqtt<M> {
    pub fn new(mqtt: M, base_topic: impl Into<String>) -> Self {
        let base = base_topic.into().trim().trim_matches('/').to_string();
        Self {
            mqtt,
            base_topic: if base.is_empty() {
                "zigbee2mqtt".to_string()
            } else {
                base
            },
        }
    }

    fn set_topic(&self, entity_id: &str) -> String {
        format!("{}/{}/set", self.base_topic, entity_id)
    }
}

#[async_trait]
impl<M: MqttGateway> Zigbee2mqttGateway for Zigbee2mqttOverMqtt<M> {
    async fn set_entity_value(
        &self,
        entity_id: &str,
        value: &JsonValue,
    ) -> Result<(), GatewayError> {
        let entity_id = entity_id.trim();
        if entity_id.is_empty() {
            return Err(GatewayError::Validation("entity_id is required".to_string()));
        }
        let payload = if value.is_object() {
            value.clone()
        } else {
            serde_json::json!({ "state": value })
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        self.mqtt
            .publish(&self.set_topic(entity_id), &bytes, 0, false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingMqtt {
        published: Mutex<Vec<(String, Vec<u8>, u8, bool)>>,
        connected: bool,
    }

    impl RecordingMqtt {
        fn new(connected: bool) -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                connected,
            }
        }
    }

    #[async_trait]
    impl MqttGateway for RecordingMqtt {
        async fn publish(
            &self,
            topic: &str,
            payload: &[u8],
            qos: u8,
            retain: bool,
        ) -> Result<(), GatewayError> {
            if !self.connected {
                return Err(GatewayError::NotReachable("mqtt disconnected".to_string()));
            }
            self.published.lock().unwrap().push((
                topic.to_string(),
                payload.to_vec(),
                qos,
                retain,
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_set_entity_value_publishes_to_set_topic() {
        let gateway = Zigbee2mqttOverMqtt::new(RecordingMqtt::new(true), "zigbee2mqtt");
        gateway
            .set_entity_value("siren_plug", &serde_json::json!({"state": true}))
            .await
            .unwrap();

        let published = gateway.mqtt.published.lock().unwrap();
        let (topic, payload, qos, retain) = &published[0];
        assert_eq!(topic, "zigbee2mqtt/siren_plug/set");
        assert_eq!(
            serde_json::from_slice::<JsonValue>(payload).unwrap(),
            serde_json::json!({"state": true})
        );
        assert_eq!(*qos, 0);
        assert!(!retain);
    }

    #[tokio::test]
    async fn test_bare_values_are_wrapped_as_state() {
        let gateway = Zigbee2mqttOverMqtt::new(RecordingMqtt::new(true), "z2m/");
        gateway
            .set_entity_value("lamp", &serde_json::json!(42))
            .await
            .unwrap();

        let published = gateway.mqtt.published.lock().unwrap();
        let (topic, payload, ..) = &published[0];
        assert_eq!(topic, "z2m/lamp/set");
        assert_eq!(
            serde_json::from_slice::<JsonValue>(payload).unwrap(),
            serde_json::json!({"state": 42})
        );
    }

    #[tokio::test]
    async fn test_disconnected_broker_surfaces_not_reachable() {
        let gateway = Zigbee2mqttOverMqtt::new(RecordingMqtt::new(false), "zigbee2mqtt");
        let err = gateway
            .set_entity_value("lamp", &serde_json::json!({"state": false}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotReachable(_)));
    }

    #[tokio::test]
    async fn test_blank_entity_id_rejected() {
        let gateway = Zigbee2mqttOverMqtt::new(RecordingMqtt::new(true), "zigbee2mqtt");
        let err = gateway
            .set_entity_value("  ", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
