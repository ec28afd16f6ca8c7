use crate::aggregate::{
    Aggregator, AggregatorSettings, IngestSnapshot, WindowScheduler, WindowSpec,
};
use crate::bus::{BusMetrics, EventBus, PublishReport};
use crate::config::StratusConfig;
use crate::distribution::{
    destination, DeliveryMetrics, Destination, DispatcherHandle, DistributionDispatcher,
};
use crate::event::{Event, SensorReading};
use crate::producer::{AdapterHealth, Producer};
use crate::registry::{EntityRegistry, RegistryError};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[cfg(test)]
mod tests;

/// Point-in-time view of every component's counters
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub ingest: IngestSnapshot,
    pub bus: BusMetrics,
    pub delivery: DeliveryMetrics,
    pub open_buckets: usize,
    pub retained_records: usize,
    pub producers: usize,
    /// Readings published after `shutdown`, never ingested
    pub ignored_after_shutdown: u64,
}

#[derive(Default)]
struct Running {
    dispatcher: Option<DispatcherHandle>,
    scheduler: Option<(watch::Sender<bool>, JoinHandle<Result<()>>)>,
}

/// Owns and wires the registry, bus, aggregator and dispatcher.
///
/// Construction subscribes the aggregator to readings. `start` attaches the
/// dispatcher and `start_scheduler` begins wall-clock flushing; both need a
/// tokio runtime. `shutdown` tears down in order so that every accepted
/// reading ends up in a flushed window and every flushed window is written.
pub struct Pipeline {
    config: StratusConfig,
    registry: Arc<EntityRegistry>,
    bus: Arc<EventBus>,
    aggregator: Arc<Aggregator>,
    dispatcher: Arc<DistributionDispatcher>,
    producers: RwLock<BTreeMap<String, Arc<dyn Producer>>>,
    running: Mutex<Running>,
    stopped: AtomicBool,
    ignored_after_shutdown: AtomicU64,
}

impl Pipeline {
    /// Build from config, with destinations taken from `[[distribution.destinations]]`
    pub fn new(config: StratusConfig) -> Result<Self> {
        let destinations = config
            .distribution
            .destinations
            .iter()
            .map(destination::from_config)
            .collect();
        Self::with_destinations(config, destinations)
    }

    /// Build from config with an explicit destination list
    pub fn with_destinations(
        config: StratusConfig,
        destinations: Vec<Arc<dyn Destination>>,
    ) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let registry = Arc::new(EntityRegistry::new());
        let bus = Arc::new(EventBus::new());

        let settings = AggregatorSettings {
            window: WindowSpec::new(config.window.size())?,
            retention: config.window.retention(),
            max_records: config.window.max_records,
        };
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            settings,
        ));
        aggregator.attach();

        let dispatcher = Arc::new(DistributionDispatcher::new(
            Arc::clone(&aggregator),
            Arc::clone(&registry),
            destinations,
            config.distribution.format,
            config.distribution.write_timeout(),
        ));

        Ok(Self {
            config,
            registry,
            bus,
            aggregator,
            dispatcher,
            producers: RwLock::new(BTreeMap::new()),
            running: Mutex::new(Running::default()),
            stopped: AtomicBool::new(false),
            ignored_after_shutdown: AtomicU64::new(0),
        })
    }

    /// Attach the dispatcher to the bus
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.dispatcher.is_some() {
            bail!("Distribution already started");
        }
        running.dispatcher = Some(Arc::clone(&self.dispatcher).start(Arc::clone(&self.bus)));
        Ok(())
    }

    /// Spawn the wall-clock window scheduler
    pub fn start_scheduler(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.scheduler.is_some() {
            bail!("Window scheduler already started");
        }

        let (tx, rx) = watch::channel(false);
        let scheduler =
            WindowScheduler::new(Arc::clone(&self.aggregator), self.config.window.grace());
        let task = tokio::spawn(scheduler.run(rx));
        running.scheduler = Some((tx, task));
        Ok(())
    }

    /// Register every entity a producer declares and keep it for health polling.
    ///
    /// All definitions must carry the producer's source. Registration stops at
    /// the first rejected definition; definitions registered before it stay.
    pub fn attach_producer(&self, producer: Arc<dyn Producer>) -> Result<(), RegistryError> {
        let source = producer.source().to_string();
        let entities = producer.entities();

        if let Some(stray) = entities.iter().find(|d| d.source != source) {
            return Err(RegistryError::InvalidDefinition(format!(
                "entity '{}' declares source '{}' but producer is '{}'",
                stray.entity_id, stray.source, source
            )));
        }

        let count = entities.len();
        for definition in entities {
            self.registry.register(definition)?;
        }

        let previous = self
            .producers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.clone(), producer);
        if previous.is_some() {
            warn!(source = %source, "Producer re-attached, replacing previous instance");
        }

        info!(source = %source, entities = count, "Producer attached");
        Ok(())
    }

    /// Publish a reading on the bus.
    ///
    /// Once `shutdown` has started, readings are no longer ingested: they are
    /// counted in `ignored_after_shutdown`, logged, and an empty report is
    /// returned.
    pub fn publish(&self, reading: SensorReading) -> PublishReport {
        if self.stopped.load(Ordering::SeqCst) {
            let ignored = self.ignored_after_shutdown.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                source = %reading.source,
                entity_id = %reading.entity_id,
                ignored,
                "Pipeline is shut down, reading ignored"
            );
            return PublishReport::default();
        }
        self.bus.publish(&Event::Reading(reading))
    }

    /// Poll every attached producer, ordered by source
    pub fn health(&self) -> Vec<(String, AdapterHealth)> {
        self.producers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(source, producer)| (source.clone(), producer.health()))
            .collect()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            ingest: self.aggregator.metrics.get_snapshot(),
            bus: self.bus.metrics(),
            delivery: self.dispatcher.metrics(),
            open_buckets: self.aggregator.open_buckets(),
            retained_records: self.aggregator.retained_records(),
            producers: self
                .producers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            ignored_after_shutdown: self.ignored_after_shutdown.load(Ordering::Relaxed),
        }
    }

    /// Stop the scheduler, stop ingesting, flush every open window and wait
    /// for queued writes to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        let running = std::mem::take(
            &mut *self.running.lock().unwrap_or_else(PoisonError::into_inner),
        );

        if let Some((tx, task)) = running.scheduler {
            let _ = tx.send(true);
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Window scheduler had failed before shutdown"),
                Err(e) => error!(error = %e, "Window scheduler task panicked"),
            }
        }

        self.aggregator.detach();
        let summary = self
            .aggregator
            .flush_all()
            .context("Failed to flush open windows on shutdown")?;
        info!(
            windows = summary.windows.len(),
            records = summary.records,
            "Flushed open windows"
        );

        if let Some(handle) = running.dispatcher {
            handle.shutdown().await?;
        }

        info!("Pipeline stopped");
        Ok(())
    }

    pub fn config(&self) -> &StratusConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn dispatcher(&self) -> &Arc<DistributionDispatcher> {
        &self.dispatcher
    }
}
