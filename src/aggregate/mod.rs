// Windowed statistics over sensor readings

mod engine;
mod history;
mod metrics;
mod record;
mod scheduler;
mod window;

pub use engine::{Aggregator, AggregatorSettings};
pub use metrics::{IngestMetrics, IngestSnapshot};
pub use record::ShortTermRecord;
pub use scheduler::WindowScheduler;
pub use window::WindowSpec;

use crate::event::ValidationError;
use chrono::{DateTime, Utc};
use std::fmt;


/// What a single boundary flush produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Ends of the windows flushed, ascending; one event was published per entry
    pub windows: Vec<DateTime<Utc>>,
    /// Records materialized across those windows
    pub records: usize,
}

/// Why a reading was dropped instead of folded into a window
#[derive(Debug, Clone, PartialEq)]
pub enum IngestError {
    Invalid(ValidationError),
    UnknownEntity(String),
    ForeignSource {
        entity_id: String,
        source: String,
        owner: String,
    },
    LateReading {
        entity_id: String,
        window_start: DateTime<Utc>,
    },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Invalid(e) => write!(f, "invalid reading: {}", e),
            IngestError::UnknownEntity(id) => write!(f, "unknown entity '{}'", id),
            IngestError::ForeignSource {
                entity_id,
                source,
                owner,
            } => write!(
                f,
                "source '{}' does not own entity '{}' (owner '{}')",
                source, entity_id, owner
            ),
            IngestError::LateReading {
                entity_id,
                window_start,
            } => write!(
                f,
                "late reading for '{}': window starting {} already flushed",
                entity_id, window_start
            ),
        }
    }
}

impl std::error::Error for IngestError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// `requested` predates the earliest retained window
    RangeTooOld {
        requested: DateTime<Utc>,
        horizon: DateTime<Utc>,
    },
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::RangeTooOld { requested, horizon } => write!(
                f,
                "range start {} predates retention horizon {}",
                requested, horizon
            ),
        }
    }
}

impl std::error::Error for QueryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushError {
    /// Boundary is not a multiple of the window size
    MisalignedBoundary(DateTime<Utc>),
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushError::MisalignedBoundary(t) => {
                write!(f, "{} is not a window boundary", t)
            }
        }
    }
}

impl std::error::Error for FlushError {}
