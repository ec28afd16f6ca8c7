use super::*;
use crate::event::{SensorReading, StatisticsComputedEvent};
use anyhow::anyhow;
use chrono::{TimeZone, Utc};
use std::sync::Mutex;
use std::thread;

fn reading_event() -> Event {
    Event::Reading(SensorReading::new(
        Utc.timestamp_opt(10, 0).unwrap(),
        "davis",
        "sensor.temp",
        20.0,
    ))
}

fn stats_event() -> Event {
    Event::StatisticsComputed(StatisticsComputedEvent {
        window_end: Utc.timestamp_opt(300, 0).unwrap(),
    })
}

#[test]
fn test_publish_reaches_all_subscribers_in_order() {
    let bus = EventBus::new();
    let calls = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second", "third"] {
        let calls = Arc::clone(&calls);
        bus.subscribe(EventKind::Reading, name, move |_: &Event| {
            calls.lock().unwrap().push(name);
            Ok(())
        });
    }

    let report = bus.publish(&reading_event());

    assert_eq!(report.delivered, 3);
    assert!(report.failed.is_empty());
    assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_publish_only_matches_exact_kind() {
    let bus = EventBus::new();
    let seen = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&seen);
    bus.subscribe(EventKind::StatisticsComputed, "stats", move |_: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert_eq!(bus.publish(&reading_event()).delivered, 0);
    assert_eq!(bus.publish(&stats_event()).delivered, 1);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_handler_does_not_block_others() {
    let bus = EventBus::new();
    let received = Arc::new(AtomicU64::new(0));

    bus.subscribe(EventKind::Reading, "broken", |_: &Event| Err(anyhow!("disk full")));

    let counter = Arc::clone(&received);
    bus.subscribe(EventKind::Reading, "healthy", move |_: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let report = bus.publish(&reading_event());

    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, vec!["broken".to_string()]);
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(bus.metrics().handler_failures, 1);
}

#[test]
fn test_panicking_handler_is_contained() {
    let bus = EventBus::new();
    let received = Arc::new(AtomicU64::new(0));

    bus.subscribe(EventKind::Reading, "panics", |_: &Event| -> anyhow::Result<()> {
        panic!("handler bug")
    });

    let counter = Arc::clone(&received);
    bus.subscribe(EventKind::Reading, "healthy", move |_: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let report = bus.publish(&reading_event());

    assert_eq!(report.failed, vec!["panics".to_string()]);
    assert_eq!(received.load(Ordering::SeqCst), 1);

    // Bus is still usable after the panic
    assert_eq!(bus.publish(&reading_event()).delivered, 2);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let bus = EventBus::new();
    let received = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&received);
    let id = bus.subscribe(EventKind::Reading, "temp", move |_: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    bus.publish(&reading_event());
    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    bus.publish(&reading_event());

    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscriber_count(EventKind::Reading), 0);
}

#[test]
fn test_no_replay_for_late_subscribers() {
    let bus = EventBus::new();
    bus.publish(&reading_event());

    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    bus.subscribe(EventKind::Reading, "late", move |_: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert_eq!(received.load(Ordering::SeqCst), 0);
}

#[test]
fn test_handler_may_publish_reentrantly() {
    let bus = Arc::new(EventBus::new());
    let stats_seen = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&stats_seen);
    bus.subscribe(EventKind::StatisticsComputed, "stats", move |_: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let inner = Arc::downgrade(&bus);
    bus.subscribe(EventKind::Reading, "relay", move |_: &Event| {
        if let Some(bus) = inner.upgrade() {
            bus.publish(&stats_event());
        }
        Ok(())
    });

    bus.publish(&reading_event());
    assert_eq!(stats_seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_publish() {
    let bus = Arc::new(EventBus::new());
    let received = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&received);
    bus.subscribe(EventKind::Reading, "count", move |_: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let mut handles = vec![];
    for _ in 0..10 {
        let bus = Arc::clone(&bus);
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                bus.publish(&reading_event());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(received.load(Ordering::SeqCst), 1000);
    let metrics = bus.metrics();
    assert_eq!(metrics.events_published, 1000);
    assert_eq!(metrics.deliveries, 1000);
    assert_eq!(metrics.subscriptions, 1);
}
