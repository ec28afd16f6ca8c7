use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

mod validation;
#[cfg(test)]
mod tests;

pub use validation::{is_valid_entity_id, validate_reading, ValidationError};

/// SensorReading is an immutable measurement published by a producer.
///
/// `timestamp` is event time (when the value was measured), not arrival time.
/// Readings are consumed by the aggregator and never retained by the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Measurement time
    pub timestamp: DateTime<Utc>,

    /// Producer identity (must own `entity_id` in the registry)
    pub source: String,

    /// Registered entity identifier (e.g., "sensor.outdoor_temperature")
    #[serde(rename = "entityId")]
    pub entity_id: String,

    /// Measured value
    pub value: f64,

    /// Free-form metadata reported alongside the value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl SensorReading {
    pub fn new(
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        entity_id: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            timestamp,
            source: source.into(),
            entity_id: entity_id.into(),
            value,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute attachment
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Validates required fields and value range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_reading(self)
    }
}

/// Published by the aggregator once every record of a window is queryable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsComputedEvent {
    #[serde(rename = "windowEnd")]
    pub window_end: DateTime<Utc>,
}

/// Every event type the bus can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Reading(SensorReading),
    StatisticsComputed(StatisticsComputedEvent),
}

/// Dispatch key for [`Event`]; subscribers register against a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Reading,
    StatisticsComputed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Reading(_) => EventKind::Reading,
            Event::StatisticsComputed(_) => EventKind::StatisticsComputed,
        }
    }
}

impl From<SensorReading> for Event {
    fn from(reading: SensorReading) -> Self {
        Event::Reading(reading)
    }
}

impl From<StatisticsComputedEvent> for Event {
    fn from(event: StatisticsComputedEvent) -> Self {
        Event::StatisticsComputed(event)
    }
}
