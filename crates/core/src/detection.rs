//! Vision-system detection snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single person/object detection reported by the vision adapter.
///
/// Rows are produced by the Frigate integration and consulted read-only by
/// the `frigate_person_detected` condition operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub provider: String,
    pub event_id: String,
    pub label: String,
    pub camera: String,
    pub zones: Vec<String>,
    pub confidence_pct: f64,
    pub observed_at: DateTime<Utc>,
}
