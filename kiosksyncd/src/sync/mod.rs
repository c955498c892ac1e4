pub mod backoff;
pub mod entry;
pub mod orchestrator;
pub mod queue_store;
pub mod scheduler;
pub mod service;
pub mod transfer;

pub use entry::{EntityKind, EntryStatus, Operation, QueueEntry, QueueEntrySummary};
pub use orchestrator::{
    OrchestratorConfig, PassOutcome, RecordRoutes, SyncError, SyncOrchestrator, SyncReport,
};
pub use queue_store::{QueueCounts, QueueError, QueueStore};
pub use scheduler::{BandwidthMode, NetworkType, SyncPolicy};
pub use service::SyncService;
