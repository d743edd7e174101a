use crate::baseline::BaselineEntry;
use crate::error::StoreError;
use crate::events::{ErrorReport, Fingerprint, HourBucket, RecordReceipt, Severity, Timestamp};
use serde::{Deserialize, Serialize};

/// Latest human-readable description of an error class
///
/// Overwritten on every occurrence so the title reflects the most recent
/// wording of the error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDefinition {
    pub fingerprint: Fingerprint,
    pub title: String,
    pub error_class: String,
    pub status: u16,
    pub severity: Severity,
    pub last_seen: Timestamp,
}

impl ErrorDefinition {
    pub fn from_report(report: &ErrorReport) -> Self {
        Self {
            fingerprint: report.fingerprint.clone(),
            title: report.title.clone(),
            error_class: report.error_class.clone(),
            status: report.status,
            severity: report.severity,
            last_seen: report.timestamp,
        }
    }
}

/// Occurrence count for one (version, hour) of a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyCount {
    pub version: String,
    pub bucket: HourBucket,
    pub count: u64,
}

/// One delivery of a raw record, identified by its content key
///
/// The key blocks another write of the same delivery until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub key: String,
    pub received_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Durable key-value backing for counters, samples, definitions and baselines
///
/// Implementations are blocking; `AggregateStore` runs them off the async
/// runtime under a timeout. Every method must be safe to call concurrently.
#[cfg_attr(test, mockall::automock)]
pub trait StoreBackend: Send + Sync {
    /// Atomically increment the (version, fingerprint, hour) counter, append the
    /// report to the bounded sample list, and refresh the error definition
    fn record(&self, report: &ErrorReport, sample_limit: usize)
        -> Result<RecordReceipt, StoreError>;

    /// `record`, unless the same delivery was already recorded and has not expired
    ///
    /// The delivery key is written in the same atomic step as the counter, so
    /// a write that completes after its caller gave up still blocks the retry.
    /// Returns `None` for a repeated delivery. Expired keys are dropped.
    fn record_delivery(
        &self,
        report: &ErrorReport,
        sample_limit: usize,
        delivery: &Delivery,
    ) -> Result<Option<RecordReceipt>, StoreError>;

    /// Sum of counters for (version, fingerprint) over the inclusive bucket range
    fn count(
        &self,
        version: &str,
        fingerprint: &Fingerprint,
        first: HourBucket,
        last: HourBucket,
    ) -> Result<u64, StoreError>;

    /// Per-fingerprint totals for a version over the inclusive bucket range
    fn fingerprint_counts(
        &self,
        version: &str,
        first: HourBucket,
        last: HourBucket,
    ) -> Result<Vec<(Fingerprint, u64)>, StoreError>;

    /// Retained samples, most recently recorded first
    fn samples(
        &self,
        version: &str,
        fingerprint: &Fingerprint,
        limit: usize,
    ) -> Result<Vec<ErrorReport>, StoreError>;

    fn definition(&self, fingerprint: &Fingerprint) -> Result<Option<ErrorDefinition>, StoreError>;

    /// Every (version, hour) counter of a fingerprint
    fn history(&self, fingerprint: &Fingerprint) -> Result<Vec<HourlyCount>, StoreError>;

    /// Persist a baseline snapshot and return its assigned id
    fn save_baseline(&self, entry: &BaselineEntry) -> Result<i64, StoreError>;

    /// All baselines registered for a version, in registration order
    fn baselines(&self, version: &str) -> Result<Vec<BaselineEntry>, StoreError>;

    /// Returns false when the hour had already been marked
    fn mark_hour_imported(&self, bucket: HourBucket) -> Result<bool, StoreError>;

    fn hour_imported(&self, bucket: HourBucket) -> Result<bool, StoreError>;

    /// Drop counters and samples older than `before`; returns rows removed
    fn prune(&self, before: HourBucket) -> Result<u64, StoreError>;

    fn ping(&self) -> Result<(), StoreError>;

    /// Push buffered writes to durable storage
    fn flush(&self) -> Result<(), StoreError>;
}
