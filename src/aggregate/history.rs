use super::record::ShortTermRecord;
use std::collections::VecDeque;

/// Bounded buffer of recently flushed records, oldest window first.
///
/// Two limits apply after every append:
/// - retention: records whose window starts before the cutoff are evicted.
///   The cutoff is `latest_end - retention` rounded up to a window boundary,
///   so a window is either fully retained or fully gone.
/// - capacity: while over `max_records`, the oldest whole window is evicted.
///   The window just appended is never evicted, even if it alone exceeds
///   the cap.
///
/// The horizon is the earliest instant from which the buffer is complete;
/// it only moves forward.
pub(crate) struct RecentHistory {
    records: VecDeque<ShortTermRecord>,
    window_ms: i64,
    retention_ms: i64,
    max_records: usize,
    horizon_ms: Option<i64>,
}

impl RecentHistory {
    pub(crate) fn new(window_ms: i64, retention_ms: i64, max_records: usize) -> Self {
        Self {
            records: VecDeque::new(),
            window_ms,
            retention_ms,
            max_records: max_records.max(1),
            horizon_ms: None,
        }
    }

    /// Retention cutoff once the window ending at `window_end_ms` is flushed
    pub(crate) fn cutoff_for(&self, window_end_ms: i64) -> i64 {
        let raw = window_end_ms - self.retention_ms;
        let aligned = raw.div_euclid(self.window_ms) * self.window_ms;
        let aligned = if aligned < raw {
            aligned + self.window_ms
        } else {
            aligned
        };
        aligned.min(window_end_ms - self.window_ms)
    }

    /// Append one flushed window. Records must already be sorted by entity id,
    /// and windows must be appended in ascending order.
    pub(crate) fn push_window(&mut self, window_end_ms: i64, records: Vec<ShortTermRecord>) {
        self.records.extend(records);

        let cutoff = self.cutoff_for(window_end_ms);
        self.advance_horizon(cutoff);
        while let Some(front) = self.records.front() {
            if front.window_start.timestamp_millis() < cutoff {
                self.records.pop_front();
            } else {
                break;
            }
        }

        let newest_start = window_end_ms - self.window_ms;
        while self.records.len() > self.max_records {
            let Some(oldest) = self.records.front().map(|r| r.window_start) else {
                break;
            };
            if oldest.timestamp_millis() >= newest_start {
                break;
            }
            while self
                .records
                .front()
                .map_or(false, |r| r.window_start == oldest)
            {
                self.records.pop_front();
            }
            self.advance_horizon(oldest.timestamp_millis() + self.window_ms);
        }
    }

    /// Earliest queryable instant, `None` until the first flush
    pub(crate) fn horizon(&self) -> Option<i64> {
        self.horizon_ms
    }

    /// Records overlapping `[start_ms, end_ms)`, in buffer order
    pub(crate) fn overlapping(
        &self,
        entity_id: Option<&str>,
        start_ms: i64,
        end_ms: i64,
    ) -> Vec<ShortTermRecord> {
        self.records
            .iter()
            .filter(|r| {
                let ws = r.window_start.timestamp_millis();
                ws < end_ms && ws + self.window_ms > start_ms
            })
            .filter(|r| entity_id.map_or(true, |id| r.entity_id == id))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    fn advance_horizon(&mut self, candidate: i64) {
        self.horizon_ms = Some(self.horizon_ms.map_or(candidate, |h| h.max(candidate)));
    }
}
