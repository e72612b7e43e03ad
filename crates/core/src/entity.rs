//! Tracked entity state and integration sources.
//!
//! An [`Entity`] row holds the latest known value of an externally-tracked
//! sensor (door contact, motion sensor, lock, ...). Sync jobs create rows;
//! every state-change notification updates them. The rule engine only ever
//! reads `last_state` through snapshots taken by the dispatcher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Synthetic entity id representing the alarm state machine itself.
///
/// Rules with an `alarm_state_in` condition are indexed under this id, and
/// the alarm-state broadcaster notifies the dispatcher with it on every
/// transition, so those rules re-evaluate without a real sensor changing.
pub const SYSTEM_ALARM_STATE_ENTITY_ID: &str = "__system.alarm_state";

/// Integration that produced an entity or a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySource {
    HomeAssistant,
    Zigbee2mqtt,
    Zwavejs,
    AlarmState,
    /// A flushed batch that accumulated entities from more than one source.
    Mixed,
}

impl std::fmt::Display for EntitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitySource::HomeAssistant => write!(f, "home_assistant"),
            EntitySource::Zigbee2mqtt => write!(f, "zigbee2mqtt"),
            EntitySource::Zwavejs => write!(f, "zwavejs"),
            EntitySource::AlarmState => write!(f, "alarm_state"),
            EntitySource::Mixed => write!(f, "mixed"),
        }
    }
}

/// Latest known value of an externally-tracked sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub source: EntitySource,
    pub last_state: Option<String>,
    pub last_changed: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Entity {
    /// Create a bare entity with no recorded state.
    pub fn new(entity_id: impl Into<String>, source: EntitySource) -> Self {
        Self {
            entity_id: entity_id.into(),
            source,
            last_state: None,
            last_changed: None,
            last_seen: None,
            attributes: HashMap::new(),
        }
    }

    /// Record a new state value, updating the change timestamps.
    pub fn record_state(&mut self, state: Option<String>, now: DateTime<Utc>) {
        if self.last_state != state {
            self.last_changed = Some(now);
        }
        self.last_state = state;
        self.last_seen = Some(now);
    }
}
