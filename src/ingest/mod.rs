/// Raw payload shapes and their adapters
pub mod adapters;

/// Seen-set for at-least-once delivery
pub mod dedup;

/// Ingestion entry point
pub mod coordinator;

pub use adapters::{BatchRecord, LiveRecord, NumericField};
pub use coordinator::{IngestOutcome, IngestionCoordinator, LiveOutcome, LivePayload};
pub use dedup::SeenSet;
