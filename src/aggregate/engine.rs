use crate::aggregate::history::RecentHistory;
use crate::aggregate::metrics::IngestMetrics;
use crate::aggregate::record::ShortTermRecord;
use crate::aggregate::window::{from_millis, Accumulator, WindowSpec};
use crate::aggregate::{FlushError, FlushSummary, IngestError, QueryError};
use crate::bus::{EventBus, SubscriptionId};
use crate::event::{Event, EventKind, SensorReading, StatisticsComputedEvent};
use crate::registry::EntityRegistry;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Aggregator tuning
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub window: WindowSpec,
    /// How far behind the latest flushed window records stay queryable
    pub retention: Duration,
    /// Hard cap on retained records across all windows
    pub max_records: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BucketKey {
    entity_id: String,
    window_start: i64,
}

/// Folds readings into per-entity windows and flushes them on boundaries.
///
/// Buckets live in a sharded concurrent map, so readings for unrelated
/// entities never contend on one lock. Flushes are serialized by `flush_gate`
/// and driven externally (see `WindowScheduler`), never by reading arrival.
pub struct Aggregator {
    registry: Arc<EntityRegistry>,
    bus: Arc<EventBus>,
    window: WindowSpec,

    /// OPEN buckets only; a bucket is removed in the same step that flushes it
    buckets: DashMap<BucketKey, Accumulator>,

    /// End (ms) of the latest flushed window, i64::MIN before the first flush.
    /// Any window ending at or before it is FLUSHED.
    flushed_through: AtomicI64,

    flush_gate: Mutex<()>,
    history: RwLock<RecentHistory>,
    subscription: Mutex<Option<SubscriptionId>>,

    pub metrics: IngestMetrics,
}

impl Aggregator {
    pub fn new(
        registry: Arc<EntityRegistry>,
        bus: Arc<EventBus>,
        settings: AggregatorSettings,
    ) -> Self {
        let retention_ms = i64::try_from(settings.retention.as_millis()).unwrap_or(i64::MAX);
        let history = RecentHistory::new(
            settings.window.size_millis(),
            retention_ms,
            settings.max_records,
        );

        Self {
            registry,
            bus,
            window: settings.window,
            buckets: DashMap::new(),
            flushed_through: AtomicI64::new(i64::MIN),
            flush_gate: Mutex::new(()),
            history: RwLock::new(history),
            subscription: Mutex::new(None),
            metrics: IngestMetrics::new(),
        }
    }

    /// Subscribe to readings on the bus.
    ///
    /// The handler holds a weak reference, so the bus never keeps the
    /// aggregator alive. Ingest faults are counted and logged here and never
    /// reported to the bus as handler failures.
    pub fn attach(self: &Arc<Self>) -> SubscriptionId {
        let weak = Arc::downgrade(self);

        let id = self
            .bus
            .subscribe(EventKind::Reading, "aggregator", move |event: &Event| {
                let (Some(aggregator), Event::Reading(reading)) = (weak.upgrade(), event) else {
                    return Ok(());
                };
                if let Err(e) = aggregator.on_reading(reading) {
                    match &e {
                        IngestError::LateReading { .. } => {
                            debug!(source = %reading.source, error = %e, "Dropped reading");
                        }
                        _ => {
                            warn!(source = %reading.source, error = %e, "Dropped reading");
                        }
                    }
                }
                Ok(())
            });

        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        id
    }

    /// Stop receiving readings from the bus
    pub fn detach(&self) {
        let id = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.bus.unsubscribe(id);
        }
    }

    pub fn window(&self) -> WindowSpec {
        self.window
    }

    /// Fold one reading into its (entity, window) bucket.
    ///
    /// Readings are dropped (and counted) when invalid, for an unregistered
    /// entity, from a source that does not own the entity, or when their
    /// window has already flushed. A flushed window is never reopened.
    pub fn on_reading(&self, reading: &SensorReading) -> Result<(), IngestError> {
        if let Err(e) = reading.validate() {
            self.metrics.record_invalid();
            return Err(IngestError::Invalid(e));
        }

        let definition = match self.registry.resolve(&reading.entity_id) {
            Some(def) => def,
            None => {
                self.metrics.record_unknown_entity();
                return Err(IngestError::UnknownEntity(reading.entity_id.clone()));
            }
        };

        if definition.source != reading.source {
            self.metrics.record_foreign_source();
            return Err(IngestError::ForeignSource {
                entity_id: reading.entity_id.clone(),
                source: reading.source.clone(),
                owner: definition.source,
            });
        }

        let ts_ms = reading.timestamp.timestamp_millis();
        let window_start = self.window.start_millis(ts_ms);
        let key = BucketKey {
            entity_id: reading.entity_id.clone(),
            window_start,
        };

        // The flushed check happens under the bucket's shard lock. A flush
        // advances `flushed_through` before it sweeps the shards, so either this
        // reading sees the new watermark, or the sweep waits for this lock and
        // picks the reading up.
        match self.buckets.entry(key) {
            Entry::Occupied(mut slot) => {
                if self.is_flushed(window_start) {
                    self.metrics.record_late();
                    return Err(self.late_error(reading, window_start));
                }
                slot.get_mut().fold(ts_ms, reading.value, &reading.attributes);
            }
            Entry::Vacant(slot) => {
                if self.is_flushed(window_start) {
                    self.metrics.record_late();
                    return Err(self.late_error(reading, window_start));
                }
                slot.insert(Accumulator::new(ts_ms, reading.value, &reading.attributes));
            }
        }

        self.metrics.record_accepted(&reading.source, ts_ms);
        Ok(())
    }

    /// Flush the window ending at `window_end`.
    ///
    /// Every OPEN bucket of that window becomes a record in the recent-history
    /// buffer, then one `StatisticsComputedEvent` is published. Windows before
    /// it that still hold OPEN buckets (a skipped tick, readings replayed from
    /// the past) are flushed first, oldest first, each with its own event.
    /// Flushing an already flushed boundary is a no-op and publishes nothing.
    ///
    /// Must not be called from a `StatisticsComputed` handler.
    pub fn on_window_boundary(
        &self,
        window_end: DateTime<Utc>,
    ) -> Result<FlushSummary, FlushError> {
        if !self.window.is_boundary(window_end) {
            return Err(FlushError::MisalignedBoundary(window_end));
        }

        let _gate = self.flush_gate.lock().unwrap_or_else(PoisonError::into_inner);

        let end_ms = window_end.timestamp_millis();
        if end_ms <= self.flushed_through.load(Ordering::SeqCst) {
            debug!(window_end = %window_end, "Window already flushed");
            return Ok(FlushSummary::default());
        }

        // Close the windows first; readings racing this flush now see them
        // as FLUSHED once they get the shard lock.
        self.flushed_through.store(end_ms, Ordering::SeqCst);

        let mut drained: BTreeMap<i64, Vec<(String, Accumulator)>> = BTreeMap::new();
        self.buckets.retain(|key, acc| {
            if key.window_start < end_ms {
                drained
                    .entry(key.window_start)
                    .or_default()
                    .push((key.entity_id.clone(), acc.clone()));
                false
            } else {
                true
            }
        });
        drained.entry(end_ms - self.window.size_millis()).or_default();

        let cutoff = self
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cutoff_for(end_ms);

        let mut summary = FlushSummary::default();

        for (start_ms, mut buckets) in drained {
            let this_end = from_millis(start_ms + self.window.size_millis());

            if start_ms < cutoff {
                let readings: u64 = buckets.iter().map(|(_, acc)| acc.count()).sum();
                self.metrics.record_expired(readings);
                warn!(
                    window_end = %this_end,
                    entities = buckets.len(),
                    readings = readings,
                    "Discarding window older than retention horizon"
                );
                continue;
            }

            buckets.sort_by(|a, b| a.0.cmp(&b.0));
            let window_start = from_millis(start_ms);
            let records: Vec<ShortTermRecord> = buckets
                .into_iter()
                .filter(|(_, acc)| acc.count() > 0)
                .map(|(entity_id, acc)| acc.into_record(window_start, entity_id))
                .collect();
            let record_count = records.len();

            self.history
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push_window(start_ms + self.window.size_millis(), records);
            self.metrics.record_flush(record_count);

            info!(window_end = %this_end, records = record_count, "Window flushed");

            // Records are visible before any subscriber hears about the window
            self.bus.publish(&Event::StatisticsComputed(StatisticsComputedEvent {
                window_end: this_end,
            }));

            summary.windows.push(this_end);
            summary.records += record_count;
        }

        Ok(summary)
    }

    /// Flush every OPEN bucket, including the current partial window.
    ///
    /// Used on teardown so no accepted reading is lost. Afterwards every
    /// reading for those windows is late.
    pub fn flush_all(&self) -> Result<FlushSummary, FlushError> {
        let newest_start = self.buckets.iter().map(|e| e.key().window_start).max();

        match newest_start {
            Some(start_ms) => {
                self.on_window_boundary(from_millis(start_ms + self.window.size_millis()))
            }
            None => Ok(FlushSummary::default()),
        }
    }

    /// Retained records overlapping `[start, end)`, oldest window first and
    /// entity id ascending within a window.
    ///
    /// Fails with `RangeTooOld` if `start` predates the retention horizon.
    pub fn query(
        &self,
        entity_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ShortTermRecord>, QueryError> {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(horizon_ms) = history.horizon() {
            if start.timestamp_millis() < horizon_ms {
                return Err(QueryError::RangeTooOld {
                    requested: start,
                    horizon: from_millis(horizon_ms),
                });
            }
        }

        if start >= end {
            return Ok(Vec::new());
        }

        Ok(history.overlapping(entity_id, start.timestamp_millis(), end.timestamp_millis()))
    }

    /// Earliest queryable instant, `None` until the first flush
    pub fn horizon(&self) -> Option<DateTime<Utc>> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .horizon()
            .map(from_millis)
    }

    /// End of the latest flushed window
    pub fn flushed_through(&self) -> Option<DateTime<Utc>> {
        match self.flushed_through.load(Ordering::SeqCst) {
            i64::MIN => None,
            ms => Some(from_millis(ms)),
        }
    }

    /// Number of OPEN (entity, window) buckets
    pub fn open_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Number of records currently retained for queries
    pub fn retained_records(&self) -> usize {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_flushed(&self, window_start_ms: i64) -> bool {
        window_start_ms + self.window.size_millis() <= self.flushed_through.load(Ordering::SeqCst)
    }

    fn late_error(&self, reading: &SensorReading, window_start_ms: i64) -> IngestError {
        IngestError::LateReading {
            entity_id: reading.entity_id.clone(),
            window_start: from_millis(window_start_ms),
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        if !self.buckets.is_empty() {
            warn!(
                open_buckets = self.buckets.len(),
                "Aggregator dropped with unflushed windows"
            );
        }
    }
}
