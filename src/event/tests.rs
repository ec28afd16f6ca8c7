use super::*;
use chrono::TimeZone;
use serde_json::json;

fn reading(entity_id: &str, value: f64) -> SensorReading {
    SensorReading::new(
        Utc.timestamp_opt(1_707_668_400, 0).unwrap(),
        "davis-vantage",
        entity_id,
        value,
    )
}

#[test]
fn test_valid_reading_passes_validation() {
    let r = reading("sensor.outdoor_temperature", 21.5).with_attribute("battery", "ok");
    assert!(r.validate().is_ok());
}

#[test]
fn test_missing_source_fails() {
    let mut r = reading("sensor.outdoor_temperature", 21.5);
    r.source = String::new();
    assert_eq!(r.validate().unwrap_err(), ValidationError::MissingSource);
}

#[test]
fn test_missing_entity_id_fails() {
    let r = reading("", 21.5);
    assert_eq!(r.validate().unwrap_err(), ValidationError::MissingEntityId);
}

#[test]
fn test_invalid_entity_id_format_fails() {
    let r = reading("Sensor.Temp", 21.5);
    assert_eq!(
        r.validate().unwrap_err(),
        ValidationError::InvalidEntityId("Sensor.Temp".to_string())
    );
}

#[test]
fn test_non_finite_value_fails() {
    assert!(matches!(
        reading("sensor.temp", f64::NAN).validate(),
        Err(ValidationError::NonFiniteValue(_))
    ));
    assert!(matches!(
        reading("sensor.temp", f64::INFINITY).validate(),
        Err(ValidationError::NonFiniteValue(_))
    ));
}

#[test]
fn test_pre_epoch_timestamp_fails() {
    let mut r = reading("sensor.temp", 1.0);
    r.timestamp = Utc.timestamp_opt(-10, 0).unwrap();
    assert_eq!(
        r.validate().unwrap_err(),
        ValidationError::InvalidTimestamp(-10_000)
    );
}

#[test]
fn test_reading_equality_is_structural() {
    let a = reading("sensor.temp", 1.0).with_attribute("unit", "C");
    let b = reading("sensor.temp", 1.0).with_attribute("unit", "C");
    let c = reading("sensor.temp", 1.0).with_attribute("unit", "F");
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_reading_deserialization() {
    let r: SensorReading = serde_json::from_value(json!({
        "timestamp": "2024-02-11T16:20:00Z",
        "source": "ecowitt",
        "entityId": "sensor.rain_rate",
        "value": 0.4
    }))
    .unwrap();

    assert_eq!(r.entity_id, "sensor.rain_rate");
    assert!(r.attributes.is_empty());
    assert!(r.validate().is_ok());
}

#[test]
fn test_event_kind() {
    let event: Event = reading("sensor.temp", 1.0).into();
    assert_eq!(event.kind(), EventKind::Reading);

    let event: Event = StatisticsComputedEvent {
        window_end: Utc.timestamp_opt(300, 0).unwrap(),
    }
    .into();
    assert_eq!(event.kind(), EventKind::StatisticsComputed);
}
