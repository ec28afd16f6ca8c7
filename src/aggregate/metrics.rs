use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for readings the aggregator accepted, dropped and flushed.
///
/// Every per-reading fault is surfaced here instead of being returned across
/// the bus.
#[derive(Default)]
pub struct IngestMetrics {
    accepted: AtomicU64,
    unknown_entity: AtomicU64,
    foreign_source: AtomicU64,
    invalid: AtomicU64,
    late: AtomicU64,
    expired: AtomicU64,
    windows_flushed: AtomicU64,
    records_flushed: AtomicU64,

    /// source -> event time of its latest accepted reading (ms)
    last_seen: DashMap<String, i64>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self, source: &str, ts_ms: i64) {
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let mut seen = self.last_seen.entry(source.to_string()).or_insert(ts_ms);
        if *seen < ts_ms {
            *seen = ts_ms;
        }
    }

    pub(crate) fn record_unknown_entity(&self) {
        self.unknown_entity.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_foreign_source(&self) {
        self.foreign_source.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_late(&self) {
        self.late.fetch_add(1, Ordering::Relaxed);
    }

    /// Readings discarded at flush because their window was already past retention
    pub(crate) fn record_expired(&self, readings: u64) {
        self.expired.fetch_add(readings, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, records: usize) {
        self.windows_flushed.fetch_add(1, Ordering::Relaxed);
        self.records_flushed
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    /// Event time of the newest reading accepted from `source`
    pub fn last_reading_from(&self, source: &str) -> Option<DateTime<Utc>> {
        self.last_seen
            .get(source)
            .and_then(|ms| DateTime::from_timestamp_millis(*ms))
    }

    pub fn get_late_count(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }

    pub fn get_snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            unknown_entity: self.unknown_entity.load(Ordering::Relaxed),
            foreign_source: self.foreign_source.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            windows_flushed: self.windows_flushed.load(Ordering::Relaxed),
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            active_sources: self.last_seen.len(),
        }
    }
}

/// Point-in-time copy of [`IngestMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub accepted: u64,
    pub unknown_entity: u64,
    pub foreign_source: u64,
    pub invalid: u64,
    pub late: u64,
    pub expired: u64,
    pub windows_flushed: u64,
    pub records_flushed: u64,
    pub active_sources: usize,
}
