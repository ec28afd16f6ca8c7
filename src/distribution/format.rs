use crate::aggregate::ShortTermRecord;
use crate::registry::{AggregationMethod, EntityRegistry};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;

/// Serialization used for exported windows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// One JSON object per record, newline terminated
    #[default]
    JsonLines,
    /// JSON Lines, gzip compressed
    JsonLinesGz,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::JsonLines => "jsonl",
            ExportFormat::JsonLinesGz => "jsonl.gz",
        }
    }

    /// Artifact name for a window. Depends only on the window end, so a
    /// replayed window overwrites rather than duplicates.
    ///
    /// Format: stats-{windowEnd}.{ext}
    /// Example: stats-20240211T162500Z.jsonl.gz
    pub fn artifact_name(&self, window_end: DateTime<Utc>) -> String {
        format!(
            "stats-{}.{}",
            window_end.format("%Y%m%dT%H%M%SZ"),
            self.extension()
        )
    }

    /// Serialize one window's records.
    ///
    /// Output is a pure function of the inputs (fixed field order, sorted
    /// attributes, zero gzip mtime), so the same window always encodes to the
    /// same bytes.
    pub fn encode(
        &self,
        records: &[ShortTermRecord],
        window_size: chrono::Duration,
        registry: &EntityRegistry,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for record in records {
            let line = ExportLine::new(record, window_size, registry);
            serde_json::to_writer(&mut body, &line)
                .context("Failed to serialize record to JSON")?;
            body.push(b'\n');
        }

        match self {
            ExportFormat::JsonLines => Ok(body),
            ExportFormat::JsonLinesGz => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&body)
                    .context("Failed to write compressed export data")?;
                encoder.finish().context("Failed to finish compression")
            }
        }
    }
}

/// Wire shape of one exported record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportLine {
    #[serde(rename = "windowStart")]
    pub window_start: DateTime<Utc>,
    #[serde(rename = "windowEnd")]
    pub window_end: DateTime<Utc>,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    #[serde(rename = "friendlyName", skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "aggregationMethod", skip_serializing_if = "Option::is_none")]
    pub aggregation_method: Option<AggregationMethod>,
    /// Value selected by the aggregation method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<f64>,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub sum: f64,
    pub count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl ExportLine {
    fn new(
        record: &ShortTermRecord,
        window_size: chrono::Duration,
        registry: &EntityRegistry,
    ) -> Self {
        let definition = registry.resolve(&record.entity_id);

        Self {
            window_start: record.window_start,
            window_end: record.window_start + window_size,
            entity_id: record.entity_id.clone(),
            friendly_name: definition.as_ref().map(|d| d.friendly_name.clone()),
            unit: definition.as_ref().map(|d| d.unit.clone()),
            aggregation_method: definition.as_ref().map(|d| d.aggregation_method),
            primary: definition
                .as_ref()
                .map(|d| record.primary(d.aggregation_method)),
            mean: record.mean,
            min: record.min,
            max: record.max,
            last: record.last,
            sum: record.sum,
            count: record.count,
            attributes: record.attributes.clone(),
        }
    }
}
