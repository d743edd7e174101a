/// Error types for the error monitor
pub mod error;

/// Core data types: reports, fingerprints, hour buckets, windows
pub mod events;

/// Error fingerprinting
pub mod fingerprint;

/// Versioned, hour-bucketed aggregate store
pub mod store;

/// Deploy baseline registry
pub mod baseline;

/// Deviation analysis
pub mod analysis;

/// Ingestion coordinator and source adapters
pub mod ingest;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use error::{ConfigError, IngestError, StoreError};
pub use events::{ErrorReport, Fingerprint, HourBucket, NormalizedRecord, TimeWindow};
