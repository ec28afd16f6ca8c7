use super::SensorReading;
use std::fmt;

/// Validation errors for SensorReading
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingSource,
    MissingEntityId,
    InvalidEntityId(String),
    InvalidTimestamp(i64),
    NonFiniteValue(f64),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingSource => write!(f, "source is required"),
            ValidationError::MissingEntityId => write!(f, "entity id is required"),
            ValidationError::InvalidEntityId(s) => {
                write!(
                    f,
                    "invalid entity id '{}': must be lowercase with optional dots/underscores",
                    s
                )
            }
            ValidationError::InvalidTimestamp(ts) => {
                write!(f, "timestamp must be after the Unix epoch, got {} ms", ts)
            }
            ValidationError::NonFiniteValue(v) => {
                write!(f, "value must be finite, got {}", v)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a SensorReading before it is folded into a window.
///
/// Validation rules:
/// - Required fields: source, entity_id
/// - Entity id format: lowercase letters, numbers, dots, underscores
/// - Timestamp: not before the Unix epoch
/// - Value: finite (NaN and infinities would poison min/max/sum)
pub fn validate_reading(reading: &SensorReading) -> Result<(), ValidationError> {
    if reading.source.is_empty() {
        return Err(ValidationError::MissingSource);
    }
    if reading.entity_id.is_empty() {
        return Err(ValidationError::MissingEntityId);
    }

    if !is_valid_entity_id(&reading.entity_id) {
        return Err(ValidationError::InvalidEntityId(reading.entity_id.clone()));
    }

    let millis = reading.timestamp.timestamp_millis();
    if millis < 0 {
        return Err(ValidationError::InvalidTimestamp(millis));
    }

    if !reading.value.is_finite() {
        return Err(ValidationError::NonFiniteValue(reading.value));
    }

    Ok(())
}

/// Validates entity id format.
///
/// Valid entity ids:
/// - Lowercase letters (a-z), numbers (0-9), underscores
/// - Dots (.) for hierarchy ("sensor.outdoor_temp")
/// - No leading/trailing dots
/// - No consecutive dots
pub fn is_valid_entity_id(entity_id: &str) -> bool {
    if entity_id.is_empty() {
        return false;
    }

    if entity_id.starts_with('.') || entity_id.ends_with('.') {
        return false;
    }

    if entity_id.contains("..") {
        return false;
    }

    entity_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_valid_entity_ids() {
        assert!(is_valid_entity_id("sensor"));
        assert!(is_valid_entity_id("sensor.temperature"));
        assert!(is_valid_entity_id("sensor.outdoor_temp"));
        assert!(is_valid_entity_id("station42.wind.gust"));
    }

    #[test]
    fn test_invalid_entity_ids() {
        assert!(!is_valid_entity_id(""));
        assert!(!is_valid_entity_id(".sensor"));
        assert!(!is_valid_entity_id("sensor."));
        assert!(!is_valid_entity_id("sensor..temp"));
        assert!(!is_valid_entity_id("Sensor.Temp"));
        assert!(!is_valid_entity_id("sensor-temp"));
        assert!(!is_valid_entity_id("sensor/temp"));
    }
}
