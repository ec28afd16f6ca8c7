use crate::aggregate::Aggregator;
use crate::bus::{EventBus, SubscriptionId};
use crate::distribution::destination::Destination;
use crate::distribution::format::ExportFormat;
use crate::event::{Event, EventKind};
use crate::registry::EntityRegistry;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// One window, serialized and ready to hand to destinations
#[derive(Debug, Clone, PartialEq)]
pub struct WindowBatch {
    pub window_end: DateTime<Utc>,
    pub artifact: String,
    pub bytes: Arc<Vec<u8>>,
    pub records: usize,
}

/// Why a single destination did not accept a batch
#[derive(Debug, Clone, PartialEq)]
pub enum DestinationWriteFailure {
    Io(String),
    TimedOut(Duration),
    Panicked,
}

impl fmt::Display for DestinationWriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationWriteFailure::Io(e) => write!(f, "write failed: {}", e),
            DestinationWriteFailure::TimedOut(d) => write!(f, "write timed out after {:?}", d),
            DestinationWriteFailure::Panicked => write!(f, "writer panicked"),
        }
    }
}

impl std::error::Error for DestinationWriteFailure {}

/// Per-destination outcome of delivering one window
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub window_end: DateTime<Utc>,
    pub artifact: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, DestinationWriteFailure)>,
}

/// Snapshot of dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryMetrics {
    pub windows_exported: u64,
    pub writes_succeeded: u64,
    pub writes_failed: u64,
}

/// Fans flushed windows out to every configured destination.
///
/// The bus handler runs on the flushing thread: it queries and serializes the
/// window right away (records are guaranteed visible at that point), then
/// queues the batch. Destination writes happen on a tokio worker, each under
/// its own timeout, so a slow or failing destination never holds up the
/// flush or the other destinations.
pub struct DistributionDispatcher {
    aggregator: Arc<Aggregator>,
    registry: Arc<EntityRegistry>,
    destinations: Vec<Arc<dyn Destination>>,
    format: ExportFormat,
    write_timeout: Duration,

    windows_exported: AtomicU64,
    writes_succeeded: AtomicU64,
    writes_failed: AtomicU64,
}

impl DistributionDispatcher {
    pub fn new(
        aggregator: Arc<Aggregator>,
        registry: Arc<EntityRegistry>,
        destinations: Vec<Arc<dyn Destination>>,
        format: ExportFormat,
        write_timeout: Duration,
    ) -> Self {
        Self {
            aggregator,
            registry,
            destinations,
            format,
            write_timeout,
            windows_exported: AtomicU64::new(0),
            writes_succeeded: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
        }
    }

    /// Subscribe to `StatisticsComputed` on `bus` and start the write worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: Arc<Self>, bus: Arc<EventBus>) -> DispatcherHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<WindowBatch>();

        info!(
            destinations = ?self.destination_names(),
            format = ?self.format,
            "Distribution dispatcher started"
        );

        let weak = Arc::downgrade(&self);
        let subscription = bus.subscribe(
            EventKind::StatisticsComputed,
            "distribution",
            move |event: &Event| {
                let (Some(dispatcher), Event::StatisticsComputed(e)) = (weak.upgrade(), event)
                else {
                    return Ok(());
                };
                match dispatcher.export_window(e.window_end)? {
                    Some(batch) => tx
                        .send(batch)
                        .context("Distribution worker is no longer running")?,
                    None => debug!(window_end = %e.window_end, "No records, nothing to export"),
                }
                Ok(())
            },
        );

        let worker = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                self.deliver(&batch).await;
            }
            debug!("Distribution worker drained");
        });

        DispatcherHandle {
            bus,
            subscription,
            worker,
        }
    }

    /// Query and serialize the window ending at `window_end`.
    ///
    /// Returns `None` when the window produced no records. Calling this
    /// repeatedly for a retained window yields identical bytes.
    pub fn export_window(&self, window_end: DateTime<Utc>) -> Result<Option<WindowBatch>> {
        let window_size = self.aggregator.window().size();
        let records = self
            .aggregator
            .query(None, window_end - window_size, window_end)
            .with_context(|| format!("Failed to query window ending {}", window_end))?;

        if records.is_empty() {
            return Ok(None);
        }

        let bytes = self
            .format
            .encode(&records, window_size, &self.registry)
            .with_context(|| format!("Failed to encode window ending {}", window_end))?;

        self.windows_exported.fetch_add(1, Ordering::Relaxed);

        Ok(Some(WindowBatch {
            window_end,
            artifact: self.format.artifact_name(window_end),
            bytes: Arc::new(bytes),
            records: records.len(),
        }))
    }

    /// Write `batch` to every destination concurrently.
    ///
    /// Never fails as a whole: each destination's outcome lands in the report.
    pub async fn deliver(&self, batch: &WindowBatch) -> DeliveryReport {
        let writes = self.destinations.iter().map(|destination| {
            let destination = Arc::clone(destination);
            let artifact = batch.artifact.clone();
            let bytes = Arc::clone(&batch.bytes);
            let limit = self.write_timeout;

            async move {
                let name = destination.name().to_string();
                let write =
                    tokio::task::spawn_blocking(move || destination.write(&artifact, &bytes));

                let outcome = match timeout(limit, write).await {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(e))) => Err(DestinationWriteFailure::Io(e.to_string())),
                    Ok(Err(_)) => Err(DestinationWriteFailure::Panicked),
                    Err(_) => Err(DestinationWriteFailure::TimedOut(limit)),
                };
                (name, outcome)
            }
        });

        let mut report = DeliveryReport {
            window_end: batch.window_end,
            artifact: batch.artifact.clone(),
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        for (name, outcome) in join_all(writes).await {
            match outcome {
                Ok(()) => {
                    self.writes_succeeded.fetch_add(1, Ordering::Relaxed);
                    report.succeeded.push(name);
                }
                Err(failure) => {
                    self.writes_failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        destination = %name,
                        artifact = %batch.artifact,
                        error = %failure,
                        "Destination write failed"
                    );
                    report.failed.push((name, failure));
                }
            }
        }

        if report.failed.is_empty() {
            info!(
                artifact = %batch.artifact,
                records = batch.records,
                destinations = report.succeeded.len(),
                "Window delivered"
            );
        } else {
            warn!(
                artifact = %batch.artifact,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "Window partially delivered"
            );
        }

        report
    }

    pub fn destination_names(&self) -> Vec<String> {
        self.destinations.iter().map(|d| d.name().to_string()).collect()
    }

    pub fn metrics(&self) -> DeliveryMetrics {
        DeliveryMetrics {
            windows_exported: self.windows_exported.load(Ordering::Relaxed),
            writes_succeeded: self.writes_succeeded.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
        }
    }
}

/// Running dispatcher: bus subscription plus write worker
pub struct DispatcherHandle {
    bus: Arc<EventBus>,
    subscription: SubscriptionId,
    worker: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Unsubscribe, then wait for every queued batch to be written.
    ///
    /// The queue sender lives in the bus handler, so dropping the subscription
    /// closes the queue and lets the worker finish.
    pub async fn shutdown(self) -> Result<()> {
        self.bus.unsubscribe(self.subscription);
        self.worker
            .await
            .context("Distribution worker panicked")?;
        Ok(())
    }
}
