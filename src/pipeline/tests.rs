use super::*;
use crate::config::{DestinationConfig, DestinationKind};
use crate::distribution::ExportLine;
use crate::producer::HealthStatus;
use crate::registry::{AggregationMethod, EntityDefinition};
use chrono::{DateTime, TimeZone, Utc};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

struct StaticProducer {
    source: String,
    entities: Vec<EntityDefinition>,
    health: AdapterHealth,
}

impl Producer for StaticProducer {
    fn source(&self) -> &str {
        &self.source
    }

    fn entities(&self) -> Vec<EntityDefinition> {
        self.entities.clone()
    }

    fn health(&self) -> AdapterHealth {
        self.health.clone()
    }
}

fn davis() -> Arc<StaticProducer> {
    Arc::new(StaticProducer {
        source: "davis".to_string(),
        entities: vec![
            EntityDefinition::new(
                "sensor.temp",
                "Temperature",
                "davis",
                "°C",
                AggregationMethod::Mean,
            ),
            EntityDefinition::new("sensor.rain", "Rain", "davis", "mm", AggregationMethod::Sum),
        ],
        health: AdapterHealth::healthy(),
    })
}

fn ecowitt() -> Arc<StaticProducer> {
    Arc::new(StaticProducer {
        source: "ecowitt".to_string(),
        entities: vec![EntityDefinition::new(
            "sensor.uv",
            "UV Index",
            "ecowitt",
            "",
            AggregationMethod::Max,
        )],
        health: AdapterHealth::degraded("gateway offline"),
    })
}

fn config_with_dir(dir: &std::path::Path) -> StratusConfig {
    let mut config = StratusConfig::default();
    config.distribution.destinations.push(DestinationConfig {
        name: "archive".to_string(),
        kind: DestinationKind::Local {
            directory: dir.to_path_buf(),
        },
    });
    config
}

#[test]
fn test_new_rejects_invalid_config() {
    let mut config = StratusConfig::default();
    config.window.size_seconds = 0;
    assert!(Pipeline::new(config).is_err());
}

#[test]
fn test_attach_producer_registers_entities() {
    let pipeline = Pipeline::new(StratusConfig::default()).unwrap();
    pipeline.attach_producer(davis()).unwrap();
    pipeline.attach_producer(ecowitt()).unwrap();

    assert_eq!(pipeline.registry().len(), 3);
    assert_eq!(pipeline.registry().list_by_source("davis").len(), 2);
    assert_eq!(
        pipeline.registry().resolve("sensor.uv").unwrap().aggregation_method,
        AggregationMethod::Max
    );
}

#[test]
fn test_attach_producer_rejects_stray_source() {
    let pipeline = Pipeline::new(StratusConfig::default()).unwrap();
    let producer = Arc::new(StaticProducer {
        source: "davis".to_string(),
        entities: vec![EntityDefinition::new(
            "sensor.uv",
            "UV Index",
            "ecowitt",
            "",
            AggregationMethod::Max,
        )],
        health: AdapterHealth::default(),
    });

    let err = pipeline.attach_producer(producer).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidDefinition(_)));
    assert!(pipeline.registry().is_empty());
    assert!(pipeline.health().is_empty());
}

#[test]
fn test_attach_producer_rejects_taken_entity() {
    let pipeline = Pipeline::new(StratusConfig::default()).unwrap();
    pipeline.attach_producer(davis()).unwrap();

    let impostor = Arc::new(StaticProducer {
        source: "ecowitt".to_string(),
        entities: vec![EntityDefinition::new(
            "sensor.temp",
            "Temperature",
            "ecowitt",
            "°C",
            AggregationMethod::Mean,
        )],
        health: AdapterHealth::default(),
    });

    let err = pipeline.attach_producer(impostor).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateEntity { .. }));
    assert_eq!(pipeline.registry().resolve("sensor.temp").unwrap().source, "davis");
}

#[test]
fn test_health_is_ordered_by_source() {
    let pipeline = Pipeline::new(StratusConfig::default()).unwrap();
    pipeline.attach_producer(ecowitt()).unwrap();
    pipeline.attach_producer(davis()).unwrap();

    let health = pipeline.health();
    assert_eq!(health.len(), 2);
    assert_eq!(health[0].0, "davis");
    assert_eq!(health[0].1.status, HealthStatus::Healthy);
    assert_eq!(health[1].0, "ecowitt");
    assert_eq!(health[1].1.status, HealthStatus::Degraded);
    assert_eq!(health[1].1.message, "gateway offline");
}

#[test]
fn test_publish_reaches_aggregator() {
    let pipeline = Pipeline::new(StratusConfig::default()).unwrap();
    pipeline.attach_producer(davis()).unwrap();

    let report = pipeline.publish(SensorReading::new(at(10), "davis", "sensor.temp", 20.0));
    assert_eq!(report.delivered, 1);
    assert!(report.failed.is_empty());

    // Unknown entities are dropped by the aggregator, not failed on the bus
    let report = pipeline.publish(SensorReading::new(at(10), "davis", "sensor.wind", 3.0));
    assert!(report.failed.is_empty());

    let status = pipeline.status();
    assert_eq!(status.ingest.accepted, 1);
    assert_eq!(status.ingest.unknown_entity, 1);
    assert_eq!(status.open_buckets, 1);
    assert_eq!(status.producers, 1);

    pipeline.aggregator().flush_all().unwrap();
}

#[tokio::test]
async fn test_start_twice_fails() {
    let pipeline = Pipeline::new(StratusConfig::default()).unwrap();
    pipeline.start().unwrap();
    assert!(pipeline.start().is_err());

    pipeline.start_scheduler().unwrap();
    assert!(pipeline.start_scheduler().is_err());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_and_writes_partial_window() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(config_with_dir(dir.path())).unwrap();
    pipeline.attach_producer(davis()).unwrap();
    pipeline.start().unwrap();

    pipeline.publish(SensorReading::new(at(10), "davis", "sensor.temp", 20.0));
    pipeline.publish(SensorReading::new(at(150), "davis", "sensor.temp", 22.0));
    pipeline.publish(SensorReading::new(at(320), "davis", "sensor.rain", 0.4));

    pipeline.shutdown().await.unwrap();

    assert_eq!(pipeline.aggregator().open_buckets(), 0);

    let first =
        std::fs::read_to_string(dir.path().join("stats-19700101T000500Z.jsonl")).unwrap();
    let lines: Vec<ExportLine> = first
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].entity_id, "sensor.temp");
    assert_eq!(lines[0].primary, Some(21.0));

    let second =
        std::fs::read_to_string(dir.path().join("stats-19700101T001000Z.jsonl")).unwrap();
    let line: ExportLine = serde_json::from_str(second.trim_end()).unwrap();
    assert_eq!(line.entity_id, "sensor.rain");
    assert_eq!(line.sum, 0.4);

    assert_eq!(pipeline.status().delivery.writes_succeeded, 2);
}

#[tokio::test]
async fn test_readings_after_shutdown_are_ignored() {
    let pipeline = Pipeline::new(StratusConfig::default()).unwrap();
    pipeline.attach_producer(davis()).unwrap();
    pipeline.start().unwrap();
    pipeline.shutdown().await.unwrap();

    let report = pipeline.publish(SensorReading::new(at(10), "davis", "sensor.temp", 20.0));
    assert_eq!(report.delivered, 0);
    pipeline.publish(SensorReading::new(at(20), "davis", "sensor.rain", 1.0));

    let status = pipeline.status();
    assert_eq!(status.ignored_after_shutdown, 2);
    assert_eq!(status.ingest.accepted, 0);
    assert_eq!(status.bus.events_published, 0);
    assert_eq!(pipeline.aggregator().open_buckets(), 0);
}

#[test]
fn test_publish_before_shutdown_is_not_ignored() {
    let pipeline = Pipeline::new(StratusConfig::default()).unwrap();
    pipeline.attach_producer(davis()).unwrap();

    pipeline.publish(SensorReading::new(at(10), "davis", "sensor.temp", 20.0));
    assert_eq!(pipeline.status().ignored_after_shutdown, 0);

    pipeline.aggregator().flush_all().unwrap();
}
