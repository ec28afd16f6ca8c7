use super::record::ShortTermRecord;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Fixed-size windows aligned to the Unix epoch.
///
/// A window is the half-open interval `[start, start + size)`; every entity
/// shares the same boundaries regardless of when its first reading arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSpec {
    size_ms: i64,
}

impl WindowSpec {
    pub fn new(size: Duration) -> Result<Self> {
        let size_ms = i64::try_from(size.as_millis()).unwrap_or(i64::MAX);
        if size_ms <= 0 {
            bail!("window size must be at least 1ms, got {:?}", size);
        }
        Ok(Self { size_ms })
    }

    pub fn from_secs(secs: u64) -> Result<Self> {
        Self::new(Duration::from_secs(secs))
    }

    pub fn size(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.size_ms)
    }

    pub fn size_millis(&self) -> i64 {
        self.size_ms
    }

    /// Start of the window containing `ts`
    pub fn start_of(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        from_millis(self.start_millis(ts.timestamp_millis()))
    }

    /// End (exclusive) of the window containing `ts`
    pub fn end_of(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        from_millis(self.start_millis(ts.timestamp_millis()) + self.size_ms)
    }

    /// True if `ts` sits exactly on a window boundary
    pub fn is_boundary(&self, ts: DateTime<Utc>) -> bool {
        ts.timestamp_millis().rem_euclid(self.size_ms) == 0
    }

    pub(crate) fn start_millis(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.size_ms) * self.size_ms
    }
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Running figures for one OPEN (entity, window) bucket.
///
/// `mean` is not tracked; it is derived once from `sum / count` at flush.
#[derive(Clone, Debug)]
pub(crate) struct Accumulator {
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
    last: f64,
    last_ts: i64,
    /// key -> (timestamp of the reading that set it, value)
    attributes: BTreeMap<String, (i64, Value)>,
}

impl Accumulator {
    pub(crate) fn new(ts_ms: i64, value: f64, attributes: &BTreeMap<String, Value>) -> Self {
        let mut acc = Self {
            sum: 0.0,
            count: 0,
            min: value,
            max: value,
            last: value,
            last_ts: ts_ms,
            attributes: BTreeMap::new(),
        };
        acc.fold(ts_ms, value, attributes);
        acc
    }

    /// Fold one reading in. Ties on timestamp go to the later arrival.
    pub(crate) fn fold(&mut self, ts_ms: i64, value: f64, attributes: &BTreeMap<String, Value>) {
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        if ts_ms >= self.last_ts {
            self.last = value;
            self.last_ts = ts_ms;
        }

        for (key, val) in attributes {
            match self.attributes.get(key) {
                Some((set_at, _)) if *set_at > ts_ms => {}
                _ => {
                    self.attributes.insert(key.clone(), (ts_ms, val.clone()));
                }
            }
        }
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn into_record(
        self,
        window_start: DateTime<Utc>,
        entity_id: String,
    ) -> ShortTermRecord {
        ShortTermRecord {
            window_start,
            entity_id,
            mean: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
            last: self.last,
            sum: self.sum,
            count: self.count,
            attributes: self
                .attributes
                .into_iter()
                .map(|(k, (_, v))| (k, v))
                .collect(),
        }
    }
}
