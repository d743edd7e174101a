use crate::error::StoreError;
use crate::events::{Fingerprint, TimeWindow, Timestamp};
use crate::store::AggregateStore;
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Occurrences of one fingerprint during a baseline window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineRate {
    pub count: u64,
    /// Occurrences per hour over the baseline window
    pub rate: f64,
}

/// Immutable snapshot of the errors a known-good deploy produced
///
/// Holds only derived per-fingerprint rates, never raw reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEntry {
    /// Assigned by the store on registration
    pub id: i64,
    pub version: String,
    pub window: TimeWindow,
    pub registered_at: Timestamp,
    pub total_occurrences: u64,
    pub fingerprints: BTreeMap<Fingerprint, BaselineRate>,
}

impl BaselineEntry {
    /// Build a snapshot from per-fingerprint counts over a window
    ///
    /// # Arguments
    ///
    /// * `version` - Version the counts were read for
    /// * `window` - Window the counts cover; rates are per hour of this window
    /// * `counts` - Occurrence totals per fingerprint
    pub fn from_counts(
        version: &str,
        window: TimeWindow,
        counts: impl IntoIterator<Item = (Fingerprint, u64)>,
    ) -> Self {
        let hours = window.hours();
        let fingerprints: BTreeMap<_, _> = counts
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(fp, count)| {
                let rate = count as f64 / hours;
                (fp, BaselineRate { count, rate })
            })
            .collect();

        Self {
            id: 0,
            version: version.to_string(),
            window,
            registered_at: Utc::now(),
            total_occurrences: fingerprints.values().map(|r| r.count).sum(),
            fingerprints,
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprints.contains_key(fingerprint)
    }

    /// Per-hour rate of a fingerprint, zero when it was not observed
    pub fn rate_of(&self, fingerprint: &Fingerprint) -> f64 {
        self.fingerprints
            .get(fingerprint)
            .map(|r| r.rate)
            .unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// Registry of baselines captured from known-good deploys
///
/// Baselines are read from, and persisted through, the aggregate store. The
/// registry never decides which deploys were successful; callers pass that
/// list in.
pub struct BaselineRegistry {
    store: Arc<AggregateStore>,
}

impl BaselineRegistry {
    pub fn new(store: Arc<AggregateStore>) -> Self {
        Self { store }
    }

    /// Capture the fingerprints and rates of `version` over `window`
    ///
    /// Every call creates a new entry, even for a version already registered.
    /// A version without recorded errors yields a valid empty baseline.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be read or written.
    pub async fn register_baseline(
        &self,
        version: &str,
        window: TimeWindow,
    ) -> Result<BaselineEntry, StoreError> {
        let counts = self.store.fingerprint_counts(version, window).await?;
        let mut entry = BaselineEntry::from_counts(version, window, counts);
        entry.id = self.store.save_baseline(entry.clone()).await?;

        info!(
            "Registered baseline #{} for {}: {} fingerprints, {} occurrences over {:.2}h",
            entry.id,
            version,
            entry.fingerprints.len(),
            entry.total_occurrences,
            window.hours()
        );
        Ok(entry)
    }

    /// Baselines for exactly the versions in `deploy_list`
    ///
    /// Entries come back in list order, and in registration order within a
    /// version. Versions never registered contribute nothing.
    pub async fn recent_baselines(
        &self,
        deploy_list: &[String],
    ) -> Result<Vec<BaselineEntry>, StoreError> {
        let mut entries = Vec::new();
        let mut seen: Vec<&str> = Vec::new();

        for version in deploy_list {
            if seen.contains(&version.as_str()) {
                continue;
            }
            seen.push(version);

            let found = self.store.baselines(version).await?;
            if found.is_empty() {
                debug!("No baseline registered for {}", version);
            }
            entries.extend(found);
        }
        Ok(entries)
    }
}
