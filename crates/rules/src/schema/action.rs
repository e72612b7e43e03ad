//! Action schema for rule THEN clauses (schema_version 1).
//!
//! Actions form an ordered list of tagged objects keyed by `type`. The
//! integration write actions (Home Assistant, Z-Wave JS, Zigbee2MQTT) are
//! admin-only and rejected at save time for non-admin authors; the alarm
//! transitions and notifications are available to every rule author.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Target states accepted by `alarm_arm`.
pub const ARMED_MODES: [&str; 4] = ["armed_home", "armed_away", "armed_night", "armed_vacation"];

/// A single THEN action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AlarmTrigger,
    AlarmDisarm,
    AlarmArm {
        mode: String,
    },
    HaCallService {
        /// `domain.service` pair, e.g. `"light.turn_on"`.
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<JsonValue>,
    },
    ZwavejsSetValue {
        node_id: i64,
        value_id: ZwaveValueId,
        value: JsonValue,
    },
    Zigbee2mqttSetValue {
        entity_id: String,
        value: JsonValue,
    },
    Zigbee2mqttSwitch {
        entity_id: String,
        state: OnOff,
    },
    Zigbee2mqttLight {
        entity_id: String,
        state: OnOff,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brightness: Option<i64>,
    },
    SendNotification {
        provider_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<JsonValue>,
    },
    /// Catch-all for action types this engine does not know.
    ///
    /// Save-time validation rejects these; the executor reports
    /// `unsupported_action` for rows that predate the closed set.
    #[serde(other)]
    Unsupported,
}

impl Action {
    /// Wire name of the action type (the `type` tag).
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::AlarmTrigger => "alarm_trigger",
            Action::AlarmDisarm => "alarm_disarm",
            Action::AlarmArm { .. } => "alarm_arm",
            Action::HaCallService { .. } => "ha_call_service",
            Action::ZwavejsSetValue { .. } => "zwavejs_set_value",
            Action::Zigbee2mqttSetValue { .. } => "zigbee2mqtt_set_value",
            Action::Zigbee2mqttSwitch { .. } => "zigbee2mqtt_switch",
            Action::Zigbee2mqttLight { .. } => "zigbee2mqtt_light",
            Action::SendNotification { .. } => "send_notification",
            Action::Unsupported => "unsupported",
        }
    }

    /// Whether only admin users may save rules containing this action.
    pub fn admin_only(&self) -> bool {
        matches!(
            self,
            Action::HaCallService { .. }
                | Action::ZwavejsSetValue { .. }
                | Action::Zigbee2mqttSetValue { .. }
                | Action::Zigbee2mqttSwitch { .. }
                | Action::Zigbee2mqttLight { .. }
        )
    }
}

/// Z-Wave JS value identifier (wire fields are camelCase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZwaveValueId {
    pub command_class: i64,
    /// Property name or index (string or integer on the wire).
    pub property: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_key: Option<JsonValue>,
}

/// Two-state switch/light target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnOff {
    On,
    Off,
}

impl OnOff {
    pub fn is_on(&self) -> bool {
        matches!(self, OnOff::On)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OnOff::On => "on",
            OnOff::Off => "off",
        }
    }
}
