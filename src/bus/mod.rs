use crate::event::{Event, EventKind};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

#[cfg(test)]
mod tests;

/// Receives events of the kinds it was subscribed to.
///
/// Handlers run synchronously on the publishing thread. Returning an error
/// (or panicking) is contained by the bus: it is logged and counted, other
/// handlers still run, and the publisher never sees it.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe on teardown
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    name: String,
    handler: Arc<dyn EventHandler>,
}

/// Outcome of a single [`EventBus::publish`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers the event was dispatched to
    pub delivered: usize,
    /// Names of handlers that returned an error or panicked
    pub failed: Vec<String>,
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Serialize)]
pub struct BusMetrics {
    pub events_published: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
    pub subscriptions: usize,
}

/// Synchronous, in-process publish/subscribe dispatcher.
///
/// Dispatch table is keyed by [`EventKind`]; handlers for a kind are invoked
/// in subscription order. There is no persistence or replay: an event published
/// before a handler subscribes is never seen by that handler.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
    events_published: AtomicU64,
    deliveries: AtomicU64,
    handler_failures: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    /// Register a closure for events of `kind`.
    ///
    /// `name` identifies the handler in logs and publish reports.
    pub fn subscribe<F>(&self, kind: EventKind, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(kind, name, Arc::new(handler))
    }

    /// Register a shared handler object for events of `kind`.
    pub fn subscribe_handler(
        &self,
        kind: EventKind,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscription {
                id,
                name: name.to_string(),
                handler,
            });

        debug!(subscription = %id, handler = %name, kind = ?kind, "Handler subscribed");
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        for subs in handlers.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                let removed = subs.remove(pos);
                debug!(subscription = %id, handler = %removed.name, "Handler unsubscribed");
                return true;
            }
        }

        false
    }

    /// Deliver `event` to every current subscriber of its kind.
    pub fn publish(&self, event: &Event) -> PublishReport {
        self.events_published.fetch_add(1, Ordering::Relaxed);

        // Snapshot the subscriber list so handlers run without the table lock
        // held; a handler may subscribe, unsubscribe or publish re-entrantly.
        let subscribers: Vec<Subscription> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        let mut report = PublishReport::default();

        for sub in &subscribers {
            report.delivered += 1;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| sub.handler.handle(event)));

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        handler = %sub.name,
                        kind = ?event.kind(),
                        error = %e,
                        "Event handler failed"
                    );
                    report.failed.push(sub.name.clone());
                }
                Err(_) => {
                    error!(handler = %sub.name, kind = ?event.kind(), "Event handler panicked");
                    report.failed.push(sub.name.clone());
                }
            }
        }

        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.handler_failures
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);

        report
    }

    /// Number of handlers currently subscribed to `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn metrics(&self) -> BusMetrics {
        let subscriptions = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum();

        BusMetrics {
            events_published: self.events_published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            subscriptions,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
