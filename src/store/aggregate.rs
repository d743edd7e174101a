//! Time-bounded access to the aggregate store
//!
//! `AggregateStore` is the only owner of counters and samples. It runs every
//! blocking backend call on the blocking thread pool under a timeout, so no
//! caller ever waits on the backing store indefinitely. It never retries; a
//! failed or expired call surfaces as `StoreError` for the caller to handle.

use crate::baseline::BaselineEntry;
use crate::error::StoreError;
use crate::events::{ErrorReport, Fingerprint, HourBucket, RecordReceipt, TimeWindow, Timestamp};
use crate::store::backend::{Delivery, ErrorDefinition, HourlyCount, StoreBackend};
use chrono::Duration as ChronoDuration;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Full occurrence history of one fingerprint across versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHistory {
    pub fingerprint: Fingerprint,
    pub definition: Option<ErrorDefinition>,
    pub by_hour_and_version: Vec<HourlyCount>,
    pub first_seen: Option<HourBucket>,
    pub last_seen: Option<HourBucket>,
    pub total: u64,
}

/// Versioned, hour-bucketed counter and sample store
pub struct AggregateStore {
    backend: Arc<dyn StoreBackend>,
    timeout: Duration,
    sample_limit: usize,
}

impl AggregateStore {
    /// Wrap a backend
    ///
    /// # Arguments
    ///
    /// * `backend` - Durable backing store
    /// * `timeout` - Upper bound for any single store call
    /// * `sample_limit` - Samples retained per (version, fingerprint)
    pub fn new(backend: Arc<dyn StoreBackend>, timeout: Duration, sample_limit: usize) -> Self {
        Self {
            backend,
            timeout,
            sample_limit: sample_limit.max(1),
        }
    }

    pub fn sample_limit(&self) -> usize {
        self.sample_limit
    }

    /// Run a backend operation off the async runtime, bounded by the timeout
    pub(crate) async fn call<T, F>(&self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn StoreBackend) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let task = tokio::task::spawn_blocking(move || op(backend.as_ref()));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => {
                if let Err(e) = &result {
                    error!("Store {} failed: {}", operation, e);
                }
                result
            }
            Ok(Err(join_error)) => {
                error!("Store {} task aborted: {}", operation, join_error);
                Err(StoreError::Unavailable(format!(
                    "{} task aborted: {}",
                    operation, join_error
                )))
            }
            Err(_) => {
                error!("Store {} timed out after {:?}", operation, self.timeout);
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    /// Atomically count one occurrence and retain it as a sample
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backing store is unreachable or times out.
    pub async fn record(&self, report: ErrorReport) -> Result<RecordReceipt, StoreError> {
        let limit = self.sample_limit;
        let receipt = self
            .call("record", move |backend| backend.record(&report, limit))
            .await?;
        debug!(
            "Recorded occurrence: hour_count={} total={} first_seen={}",
            receipt.hour_count, receipt.total_count, receipt.first_seen
        );
        Ok(receipt)
    }

    /// Count one delivery of an occurrence at most once
    ///
    /// The delivery key is stored with the counter, so even when this call
    /// times out and the write completes later, a retry is not counted again.
    ///
    /// # Returns
    ///
    /// `None` if the delivery had already been recorded
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backing store is unreachable or times out.
    pub async fn record_once(
        &self,
        report: ErrorReport,
        delivery: Delivery,
    ) -> Result<Option<RecordReceipt>, StoreError> {
        let limit = self.sample_limit;
        let receipt = self
            .call("record", move |backend| {
                backend.record_delivery(&report, limit, &delivery)
            })
            .await?;
        if let Some(receipt) = &receipt {
            debug!(
                "Recorded occurrence: hour_count={} total={} first_seen={}",
                receipt.hour_count, receipt.total_count, receipt.first_seen
            );
        }
        Ok(receipt)
    }

    /// Occurrences of a fingerprint for a version within the window's hour buckets
    ///
    /// The window end is exclusive, so a window ending on the hour does not
    /// read the hour that starts there.
    pub async fn counts(
        &self,
        version: &str,
        fingerprint: &Fingerprint,
        window: TimeWindow,
    ) -> Result<u64, StoreError> {
        let version = version.to_string();
        let fingerprint = fingerprint.clone();
        self.call("counts", move |backend| {
            backend.count(
                &version,
                &fingerprint,
                window.first_bucket(),
                window.last_bucket(),
            )
        })
        .await
    }

    /// Retained samples, most recent first; at most `limit` entries
    pub async fn samples(
        &self,
        version: &str,
        fingerprint: &Fingerprint,
        limit: usize,
    ) -> Result<Vec<ErrorReport>, StoreError> {
        let version = version.to_string();
        let fingerprint = fingerprint.clone();
        let limit = limit.min(self.sample_limit);
        self.call("samples", move |backend| {
            backend.samples(&version, &fingerprint, limit)
        })
        .await
    }

    /// Per-fingerprint totals for a version within a window, largest first
    pub async fn fingerprint_counts(
        &self,
        version: &str,
        window: TimeWindow,
    ) -> Result<Vec<(Fingerprint, u64)>, StoreError> {
        let version = version.to_string();
        self.call("fingerprint_counts", move |backend| {
            backend.fingerprint_counts(&version, window.first_bucket(), window.last_bucket())
        })
        .await
    }

    /// Every fingerprint ever seen on a version with its retained total
    pub async fn version_errors(&self, version: &str) -> Result<Vec<(Fingerprint, u64)>, StoreError> {
        let version = version.to_string();
        self.call("version_errors", move |backend| {
            backend.fingerprint_counts(&version, HourBucket(i64::MIN), HourBucket(i64::MAX))
        })
        .await
    }

    pub async fn describe(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ErrorDefinition>, StoreError> {
        let fingerprint = fingerprint.clone();
        self.call("describe", move |backend| backend.definition(&fingerprint))
            .await
    }

    /// Per version and hour counts for a fingerprint, with first/last seen hours
    pub async fn error_history(&self, fingerprint: &Fingerprint) -> Result<ErrorHistory, StoreError> {
        let fp = fingerprint.clone();
        let (definition, counts) = self
            .call("error_history", move |backend| {
                Ok((backend.definition(&fp)?, backend.history(&fp)?))
            })
            .await?;

        Ok(ErrorHistory {
            fingerprint: fingerprint.clone(),
            definition,
            first_seen: counts.iter().map(|c| c.bucket).min(),
            last_seen: counts.iter().map(|c| c.bucket).max(),
            total: counts.iter().map(|c| c.count).sum(),
            by_hour_and_version: counts,
        })
    }

    /// Record that a warehouse hour has been imported; false if it already was
    pub async fn mark_hour_imported(&self, bucket: HourBucket) -> Result<bool, StoreError> {
        self.call("mark_hour_imported", move |backend| {
            backend.mark_hour_imported(bucket)
        })
        .await
    }

    pub async fn hour_imported(&self, bucket: HourBucket) -> Result<bool, StoreError> {
        self.call("hour_imported", move |backend| backend.hour_imported(bucket))
            .await
    }

    /// Drop counters and samples older than `retention` before `now`
    pub async fn prune(&self, now: Timestamp, retention: ChronoDuration) -> Result<u64, StoreError> {
        let cutoff = HourBucket::of(now - retention);
        let removed = self
            .call("prune", move |backend| backend.prune(cutoff))
            .await?;
        info!("Pruned {} rows older than {}", removed, cutoff);
        Ok(removed)
    }

    pub(crate) async fn save_baseline(&self, entry: BaselineEntry) -> Result<i64, StoreError> {
        self.call("save_baseline", move |backend| backend.save_baseline(&entry))
            .await
    }

    pub(crate) async fn baselines(&self, version: &str) -> Result<Vec<BaselineEntry>, StoreError> {
        let version = version.to_string();
        self.call("baselines", move |backend| backend.baselines(&version))
            .await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.call("ping", |backend| backend.ping()).await
    }

    /// Flush pending writes before shutdown
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.call("flush", |backend| backend.flush()).await?;
        info!("Aggregate store flushed");
        Ok(())
    }
}
