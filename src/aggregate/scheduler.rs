use crate::aggregate::{Aggregator, FlushSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info};

/// Drives window flushes from the wall clock.
///
/// The boundary for the window ending at `E` fires at `E + grace`, so readings
/// that arrive up to `grace` after the window closes are still folded in.
/// Flushing never depends on reading arrival: a silent source still gets its
/// windows closed on time.
pub struct WindowScheduler {
    aggregator: Arc<Aggregator>,
    grace: chrono::Duration,
}

impl WindowScheduler {
    pub fn new(aggregator: Arc<Aggregator>, grace: Duration) -> Self {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        Self { aggregator, grace }
    }

    /// Latest boundary whose grace period has elapsed at `now`
    pub fn due_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.aggregator.window().start_of(now - self.grace)
    }

    /// Wall-clock instant at which the next boundary after `now` becomes due
    pub fn next_fire_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.due_boundary(now) + self.aggregator.window().size() + self.grace
    }

    /// Flush whatever boundary is due at `now`
    pub fn tick(&self, now: DateTime<Utc>) -> Result<FlushSummary> {
        let boundary = self.due_boundary(now);
        self.aggregator
            .on_window_boundary(boundary)
            .with_context(|| format!("Failed to flush window ending {}", boundary))
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Returns an error only if a flush fails, which means the scheduler can
    /// no longer guarantee windows close; callers should treat that as fatal.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            window_seconds = self.aggregator.window().size().num_seconds(),
            grace_seconds = self.grace.num_seconds(),
            "Starting window scheduler"
        );

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let now = Utc::now();
            let wait = (self.next_fire_at(now) - now)
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = sleep(wait) => {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!(error = %e, "Window scheduler stopped");
                        return Err(e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Window scheduler stopped");
        Ok(())
    }
}
