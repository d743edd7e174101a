use crate::baseline::BaselineEntry;
use crate::error::StoreError;
use crate::events::{ErrorReport, Fingerprint, HourBucket, RecordReceipt, Timestamp};
use crate::store::backend::{Delivery, ErrorDefinition, HourlyCount, StoreBackend};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

type CounterKey = (String, Fingerprint, HourBucket);
type SampleKey = (String, Fingerprint);

#[derive(Default)]
struct MemoryState {
    counters: BTreeMap<CounterKey, u64>,
    samples: HashMap<SampleKey, VecDeque<(HourBucket, ErrorReport)>>,
    definitions: HashMap<Fingerprint, ErrorDefinition>,
    baselines: Vec<BaselineEntry>,
    imported_hours: BTreeSet<HourBucket>,
    /// Delivery key to its expiry
    deliveries: HashMap<String, Timestamp>,
    next_baseline_id: i64,
}

impl MemoryState {
    fn record(&mut self, report: &ErrorReport, sample_limit: usize) -> RecordReceipt {
        let fingerprint = &report.fingerprint;
        let bucket = report.bucket();

        let seen_before = self.counters.keys().any(|(_, fp, _)| fp == fingerprint);

        let hour_count = {
            let counter = self
                .counters
                .entry((report.version.clone(), fingerprint.clone(), bucket))
                .or_insert(0);
            *counter += 1;
            *counter
        };

        let total_count: u64 = self
            .counters
            .iter()
            .filter(|((version, fp, _), _)| version == &report.version && fp == fingerprint)
            .map(|(_, count)| count)
            .sum();

        let samples = self
            .samples
            .entry((report.version.clone(), fingerprint.clone()))
            .or_default();
        samples.push_back((bucket, report.clone()));
        while samples.len() > sample_limit {
            samples.pop_front();
        }

        self.definitions
            .insert(fingerprint.clone(), ErrorDefinition::from_report(report));

        RecordReceipt {
            hour_count,
            total_count,
            first_seen: !seen_before,
        }
    }
}

/// In-process backend for tests and ephemeral runs; nothing survives a restart
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("state lock poisoned".into()))
    }
}

impl StoreBackend for InMemoryBackend {
    fn record(
        &self,
        report: &ErrorReport,
        sample_limit: usize,
    ) -> Result<RecordReceipt, StoreError> {
        Ok(self.lock()?.record(report, sample_limit))
    }

    fn record_delivery(
        &self,
        report: &ErrorReport,
        sample_limit: usize,
        delivery: &Delivery,
    ) -> Result<Option<RecordReceipt>, StoreError> {
        let mut state = self.lock()?;
        state
            .deliveries
            .retain(|_, expires_at| *expires_at > delivery.received_at);
        if state.deliveries.contains_key(&delivery.key) {
            return Ok(None);
        }

        state
            .deliveries
            .insert(delivery.key.clone(), delivery.expires_at);
        Ok(Some(state.record(report, sample_limit)))
    }

    fn count(
        &self,
        version: &str,
        fingerprint: &Fingerprint,
        first: HourBucket,
        last: HourBucket,
    ) -> Result<u64, StoreError> {
        let state = self.lock()?;
        Ok(state
            .counters
            .iter()
            .filter(|((v, fp, bucket), _)| {
                v == version && fp == fingerprint && *bucket >= first && *bucket <= last
            })
            .map(|(_, count)| count)
            .sum())
    }

    fn fingerprint_counts(
        &self,
        version: &str,
        first: HourBucket,
        last: HourBucket,
    ) -> Result<Vec<(Fingerprint, u64)>, StoreError> {
        let state = self.lock()?;
        let mut totals: BTreeMap<Fingerprint, u64> = BTreeMap::new();
        for ((v, fp, bucket), count) in &state.counters {
            if v == version && *bucket >= first && *bucket <= last {
                *totals.entry(fp.clone()).or_insert(0) += count;
            }
        }

        let mut totals: Vec<_> = totals.into_iter().collect();
        totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(totals)
    }

    fn samples(
        &self,
        version: &str,
        fingerprint: &Fingerprint,
        limit: usize,
    ) -> Result<Vec<ErrorReport>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .samples
            .get(&(version.to_string(), fingerprint.clone()))
            .map(|samples| {
                samples
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|(_, report)| report.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn definition(&self, fingerprint: &Fingerprint) -> Result<Option<ErrorDefinition>, StoreError> {
        Ok(self.lock()?.definitions.get(fingerprint).cloned())
    }

    fn history(&self, fingerprint: &Fingerprint) -> Result<Vec<HourlyCount>, StoreError> {
        let state = self.lock()?;
        let mut history: Vec<_> = state
            .counters
            .iter()
            .filter(|((_, fp, _), _)| fp == fingerprint)
            .map(|((version, _, bucket), count)| HourlyCount {
                version: version.clone(),
                bucket: *bucket,
                count: *count,
            })
            .collect();
        history.sort_by(|a, b| a.bucket.cmp(&b.bucket).then_with(|| a.version.cmp(&b.version)));
        Ok(history)
    }

    fn save_baseline(&self, entry: &BaselineEntry) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        state.next_baseline_id += 1;
        let mut stored = entry.clone();
        stored.id = state.next_baseline_id;
        state.baselines.push(stored);
        Ok(state.next_baseline_id)
    }

    fn baselines(&self, version: &str) -> Result<Vec<BaselineEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .baselines
            .iter()
            .filter(|entry| entry.version == version)
            .cloned()
            .collect())
    }

    fn mark_hour_imported(&self, bucket: HourBucket) -> Result<bool, StoreError> {
        Ok(self.lock()?.imported_hours.insert(bucket))
    }

    fn hour_imported(&self, bucket: HourBucket) -> Result<bool, StoreError> {
        Ok(self.lock()?.imported_hours.contains(&bucket))
    }

    fn prune(&self, before: HourBucket) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let counters_before = state.counters.len();
        state.counters.retain(|(_, _, bucket), _| *bucket >= before);
        let mut removed = (counters_before - state.counters.len()) as u64;

        for samples in state.samples.values_mut() {
            let len = samples.len();
            samples.retain(|(bucket, _)| *bucket >= before);
            removed += (len - samples.len()) as u64;
        }
        state.samples.retain(|_, samples| !samples.is_empty());
        let cutoff = before.start();
        state.deliveries.retain(|_, expires_at| *expires_at > cutoff);
        Ok(removed)
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Severity, Source};
    use chrono::Utc;

    fn report(version: &str, fingerprint: &str) -> ErrorReport {
        ErrorReport {
            fingerprint: Fingerprint::new(fingerprint),
            version: version.to_string(),
            timestamp: Utc::now(),
            title: "Boom".to_string(),
            error_class: "ERROR 500".to_string(),
            status: 500,
            severity: Severity::Error,
            route: String::new(),
            resource: String::new(),
            ip: String::new(),
            module: String::new(),
            stack_trace: String::new(),
            source: Source::Live,
        }
    }

    #[test]
    fn test_fingerprint_counts_sorted_by_total() {
        let backend = InMemoryBackend::new();
        backend.record(&report("v1", "bbbb"), 5).unwrap();
        backend.record(&report("v1", "aaaa"), 5).unwrap();
        backend.record(&report("v1", "aaaa"), 5).unwrap();
        backend.record(&report("v1", "cccc"), 5).unwrap();

        let bucket = HourBucket::of(Utc::now());
        let counts = backend
            .fingerprint_counts("v1", HourBucket(bucket.0 - 1), bucket)
            .unwrap();
        assert_eq!(
            counts,
            vec![
                (Fingerprint::new("aaaa"), 2),
                (Fingerprint::new("bbbb"), 1),
                (Fingerprint::new("cccc"), 1),
            ]
        );
    }

    #[test]
    fn test_sample_bound() {
        let backend = InMemoryBackend::new();
        for _ in 0..7 {
            backend.record(&report("v1", "aaaa"), 4).unwrap();
        }
        let samples = backend.samples("v1", &Fingerprint::new("aaaa"), 100).unwrap();
        assert_eq!(samples.len(), 4);
        assert!(backend.samples("v2", &Fingerprint::new("aaaa"), 100).unwrap().is_empty());
    }

    #[test]
    fn test_repeated_delivery_is_counted_once() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let delivery = Delivery {
            key: "k1".to_string(),
            received_at: now,
            expires_at: now + chrono::Duration::minutes(15),
        };

        assert!(backend
            .record_delivery(&report("v1", "aaaa"), 5, &delivery)
            .unwrap()
            .is_some());
        assert!(backend
            .record_delivery(&report("v1", "aaaa"), 5, &delivery)
            .unwrap()
            .is_none());
        assert_eq!(backend.samples("v1", &Fingerprint::new("aaaa"), 10).unwrap().len(), 1);

        let expired = Delivery {
            received_at: now + chrono::Duration::minutes(15),
            expires_at: now + chrono::Duration::minutes(30),
            ..delivery
        };
        assert!(backend
            .record_delivery(&report("v1", "aaaa"), 5, &expired)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_baseline_ids_increase() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let entry = BaselineEntry {
            id: 0,
            version: "v1".to_string(),
            window: crate::events::TimeWindow::new(now, now),
            registered_at: now,
            total_occurrences: 0,
            fingerprints: BTreeMap::new(),
        };
        assert_eq!(backend.save_baseline(&entry).unwrap(), 1);
        assert_eq!(backend.save_baseline(&entry).unwrap(), 2);
        assert_eq!(backend.baselines("v1").unwrap().len(), 2);
    }
}
