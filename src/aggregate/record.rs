use crate::registry::AggregationMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Flushed statistics for one entity over one window.
///
/// Created exactly once per (entity, window) at flush; `count` is always >= 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShortTermRecord {
    #[serde(rename = "windowStart")]
    pub window_start: DateTime<Utc>,

    #[serde(rename = "entityId")]
    pub entity_id: String,

    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub sum: f64,

    /// Readings folded into this record
    pub count: u64,

    /// Union of reading attributes; newest reading wins per key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl ShortTermRecord {
    /// The single number `method` selects for consumers that want one value
    pub fn primary(&self, method: AggregationMethod) -> f64 {
        match method {
            AggregationMethod::Mean => self.mean,
            AggregationMethod::Min => self.min,
            AggregationMethod::Max => self.max,
            AggregationMethod::Sum => self.sum,
            AggregationMethod::Last => self.last,
        }
    }
}
