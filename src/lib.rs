// Configuration (TOML + env overrides)
pub mod config;

// Sensor readings and pipeline events
pub mod event;

// Entity catalog
pub mod registry;

// In-process publish/subscribe
pub mod bus;

// Windowed statistics
pub mod aggregate;

// Fan-out of flushed windows to destinations
pub mod distribution;

// Producer (adapter) contract and health
pub mod producer;

// Component wiring and teardown
pub mod pipeline;

pub use event::{Event, EventKind, SensorReading, StatisticsComputedEvent};
