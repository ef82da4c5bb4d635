//! Copies stream entries and stored events into a DuckDB warehouse.
//!
//! Each [`SyncJob`] reads one source in id order and resumes after its
//! checkpoint. Every run is recorded as a [`SyncLog`].

pub mod job;
pub mod source;
pub mod sync;
pub mod writer;

pub use job::{SourceKind, SyncJob, SyncLog, SyncStatus};
pub use source::{EventStoreSource, StreamSource, SyncSource, WarehouseRow};
pub use sync::{SyncRun, WarehouseSync};
pub use writer::Warehouse;

/// Jobs the service registers at startup.
pub fn default_jobs() -> Vec<SyncJob> {
    vec![
        SyncJob::new("events", SourceKind::Events, "pulse_events"),
        SyncJob::new("stream", SourceKind::Stream, "pulse_stream"),
    ]
}
