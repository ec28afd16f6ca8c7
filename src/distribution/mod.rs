// Distribution of flushed windows to destinations

pub mod destination;
mod dispatcher;
pub mod format;

pub use destination::{Destination, LocalDirectory};
pub use dispatcher::{
    DeliveryMetrics, DeliveryReport, DestinationWriteFailure, DispatcherHandle,
    DistributionDispatcher, WindowBatch,
};
pub use format::{ExportFormat, ExportLine};
