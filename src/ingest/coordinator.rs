use crate::analysis::{DeviationAnalyzer, DeviationResult};
use crate::baseline::{BaselineEntry, BaselineRegistry};
use crate::config::IngestConfig;
use crate::error::{ConfigError, IngestError, StoreError};
use crate::events::{
    monitoring_version, ErrorReport, Fingerprint, HourBucket, NormalizedRecord, TimeWindow,
    Timestamp,
};
use crate::fingerprint::Fingerprinter;
use crate::ingest::adapters::{adapt_batch, adapt_live, Adapted, BatchRecord, LiveRecord};
use crate::ingest::dedup::SeenSet;
use crate::store::{AggregateStore, Delivery};
use chrono::Utc;
use log::{debug, error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

/// One call from the deploy-time scraper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePayload {
    /// Version currently being deployed
    pub version: String,
    /// When monitoring of this deploy began; the candidate window starts here
    pub deploy_started_at: Timestamp,
    /// Recent successful deploys to compare against
    #[serde(default)]
    pub baseline_versions: Vec<String>,
    pub record: LiveRecord,
}

/// What happened to one ingested record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Stored {
        fingerprint: Fingerprint,
        hour_count: u64,
        first_seen: bool,
    },
    /// Same content was already counted recently
    Duplicate { dedup_key: String },
    /// Well-formed but intentionally not counted
    Skipped { reason: String },
    Failed { error: IngestError },
}

impl IngestOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, IngestOutcome::Stored { .. })
    }
}

/// Result of a live ingestion: the store outcome plus the current deviations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveOutcome {
    pub outcome: IngestOutcome,
    pub deviations: Vec<DeviationResult>,
    /// Set when the record was handled but the analysis could not run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_error: Option<StoreError>,
}

/// Single entry point for both ingestion paths
///
/// Adapts raw records, fingerprints them, writes each exactly once to the
/// aggregate store, and for live deploys runs the deviation analysis. A failed
/// record never affects other records.
pub struct IngestionCoordinator {
    store: Arc<AggregateStore>,
    registry: Arc<BaselineRegistry>,
    analyzer: DeviationAnalyzer,
    fingerprinter: Fingerprinter,
    seen: Mutex<SeenSet>,
    config: IngestConfig,
    version_pattern: Option<Regex>,
}

impl IngestionCoordinator {
    /// Create a coordinator over already constructed components
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the batch version pattern does
    /// not compile.
    pub fn new(
        store: Arc<AggregateStore>,
        registry: Arc<BaselineRegistry>,
        analyzer: DeviationAnalyzer,
        config: IngestConfig,
    ) -> Result<Self, ConfigError> {
        let version_pattern = config.version_regex()?;
        Ok(Self {
            store,
            registry,
            analyzer,
            fingerprinter: Fingerprinter::new(),
            seen: Mutex::new(SeenSet::new(config.dedup_ttl(), config.dedup_capacity)),
            config,
            version_pattern,
        })
    }

    /// Ingest one scraped record of a deploying version and analyze the deploy
    ///
    /// Occurrences are stored under the monitoring scope of the version. The
    /// analysis compares the window from `deploy_started_at` until now with the
    /// baselines of `baseline_versions`. Analysis also runs for duplicate and
    /// skipped records, so a retried call still returns the current deviations.
    pub async fn ingest_live(&self, payload: LivePayload) -> LiveOutcome {
        let now = Utc::now();
        let scope = monitoring_version(&payload.version);

        let outcome = match adapt_live(&scope, &payload.record, now) {
            Ok(Adapted::Record(record)) => {
                let key = dedup_key("live", &payload.version, &payload.record);
                self.store_record(record, key, now).await
            }
            Ok(Adapted::Ignored(reason)) => skipped(reason),
            Err(e) => malformed(e),
        };

        if let IngestOutcome::Failed { .. } = outcome {
            return LiveOutcome {
                outcome,
                deviations: Vec::new(),
                analysis_error: None,
            };
        }

        let window = TimeWindow::new(payload.deploy_started_at, now);
        match self
            .analyze_deploy(&scope, window, &payload.baseline_versions)
            .await
        {
            Ok(deviations) => LiveOutcome {
                outcome,
                deviations,
                analysis_error: None,
            },
            Err(e) => {
                error!("Deviation analysis for {} failed: {}", payload.version, e);
                LiveOutcome {
                    outcome,
                    deviations: Vec::new(),
                    analysis_error: Some(e),
                }
            }
        }
    }

    /// Ingest one warehouse row; accounting only, never analyzes
    pub async fn ingest_batch(&self, raw: BatchRecord) -> IngestOutcome {
        let now = Utc::now();
        let record = match adapt_batch(&raw) {
            Ok(Adapted::Record(record)) => record,
            Ok(Adapted::Ignored(reason)) => return skipped(reason),
            Err(e) => return malformed(e),
        };

        if let Some(pattern) = &self.version_pattern {
            if !pattern.is_match(&record.version) {
                return skipped(format!("version '{}' is not tracked", record.version));
            }
        }

        let key = dedup_key("batch", &raw.version_id, &raw);
        self.store_record(record, key, now).await
    }

    /// Ingest a batch of warehouse rows; each row's outcome is independent
    pub async fn ingest_batch_all(&self, rows: Vec<BatchRecord>) -> Vec<IngestOutcome> {
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(self.ingest_batch(row).await);
        }

        let stored = outcomes.iter().filter(|o| o.is_stored()).count();
        info!("Batch ingested: {} of {} rows stored", stored, outcomes.len());
        outcomes
    }

    /// Import the rows of one warehouse hour, at most once per hour
    ///
    /// The hour is marked imported only when no row failed to reach the
    /// store; otherwise it stays open for a rerun.
    ///
    /// # Returns
    ///
    /// `None` if the hour had already been imported, otherwise the per-row
    /// outcomes
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the imported-hour marker cannot be read or written.
    pub async fn import_hour(
        &self,
        hour: HourBucket,
        rows: Vec<BatchRecord>,
    ) -> Result<Option<Vec<IngestOutcome>>, StoreError> {
        if self.store.hour_imported(hour).await? {
            info!("Hour {} already imported, skipping", hour);
            return Ok(None);
        }

        let outcomes = self.ingest_batch_all(rows).await;
        let unstored = outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    IngestOutcome::Failed {
                        error: IngestError::Store(_)
                    }
                )
            })
            .count();
        if unstored > 0 {
            warn!(
                "Hour {} not marked imported: {} rows could not be stored",
                hour, unstored
            );
            return Ok(Some(outcomes));
        }

        self.store.mark_hour_imported(hour).await?;
        Ok(Some(outcomes))
    }

    /// Register the monitored window of a successful deploy as a baseline
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be read or written.
    pub async fn register_deploy_baseline(
        &self,
        version: &str,
        window: TimeWindow,
    ) -> Result<BaselineEntry, StoreError> {
        self.registry
            .register_baseline(&monitoring_version(version), window)
            .await
    }

    /// Analyze a deploy's monitoring scope against the given deploys' baselines
    pub async fn analyze_deploy(
        &self,
        scope: &str,
        window: TimeWindow,
        baseline_versions: &[String],
    ) -> Result<Vec<DeviationResult>, StoreError> {
        let scoped: Vec<String> = baseline_versions
            .iter()
            .map(|v| monitoring_version(v))
            .collect();
        let baselines = self.registry.recent_baselines(&scoped).await?;
        self.analyzer.analyze(scope, window, &baselines).await
    }

    async fn store_record(
        &self,
        mut record: NormalizedRecord,
        key: String,
        now: Timestamp,
    ) -> IngestOutcome {
        if let Some(prefix) = self
            .config
            .uri_blocklist
            .iter()
            .find(|prefix| record.resource.starts_with(prefix.as_str()))
        {
            return skipped(format!("resource matches blocklist entry '{}'", prefix));
        }

        if record.timestamp > now + self.config.max_clock_skew() {
            warn!(
                "Clamping future timestamp {} of {} to {}",
                record.timestamp, record.version, now
            );
            record.timestamp = now;
        }

        if !self.remember(&key) {
            debug!("Duplicate delivery {} for {}", key, record.version);
            return IngestOutcome::Duplicate { dedup_key: key };
        }

        let signature = self.fingerprinter.signature(&record);
        let report = ErrorReport {
            fingerprint: signature.fingerprint.clone(),
            version: record.version,
            timestamp: record.timestamp,
            title: signature.title,
            error_class: signature.error_class,
            status: record.status,
            severity: record.severity,
            route: record.route,
            resource: record.resource,
            ip: record.ip,
            module: record.module,
            stack_trace: signature.stack_trace,
            source: record.source,
        };

        let delivery = Delivery {
            key,
            received_at: now,
            expires_at: now + self.config.dedup_ttl(),
        };
        let key = delivery.key.clone();

        match self.store.record_once(report, delivery).await {
            Ok(None) => {
                debug!("Delivery {} was already stored", key);
                IngestOutcome::Duplicate { dedup_key: key }
            }
            Ok(Some(receipt)) => {
                if receipt.first_seen {
                    info!("First occurrence of {}", signature.fingerprint);
                }
                IngestOutcome::Stored {
                    fingerprint: signature.fingerprint,
                    hour_count: receipt.hour_count,
                    first_seen: receipt.first_seen,
                }
            }
            Err(e) => {
                // A write that still lands is caught by the stored delivery key
                self.forget(&key);
                IngestOutcome::Failed {
                    error: IngestError::Store(e),
                }
            }
        }
    }

    fn remember(&self, key: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(key),
            Err(poisoned) => poisoned.into_inner().insert(key),
        }
    }

    fn forget(&self, key: &str) {
        match self.seen.lock() {
            Ok(mut seen) => seen.forget(key),
            Err(poisoned) => poisoned.into_inner().forget(key),
        }
    }
}

/// Content hash identifying a raw record delivery
fn dedup_key<T: Serialize>(source: &str, version: &str, raw: &T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0x1f]);
    hasher.update(version.as_bytes());
    hasher.update([0x1f]);
    // Serializing plain structs of strings and numbers cannot fail
    if let Ok(bytes) = serde_json::to_vec(raw) {
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize())
}

fn skipped(reason: String) -> IngestOutcome {
    warn!("Skipping record: {}", reason);
    IngestOutcome::Skipped { reason }
}

fn malformed(error: IngestError) -> IngestOutcome {
    warn!("Dropping record: {}", error);
    IngestOutcome::Failed { error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Classification;
    use crate::config::AnalysisConfig;
    use crate::ingest::adapters::NumericField;
    use crate::store::backend::MockStoreBackend;
    use crate::store::{InMemoryBackend, StoreBackend};
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn coordinator_with(
        backend: Arc<dyn StoreBackend>,
        config: IngestConfig,
    ) -> (IngestionCoordinator, Arc<AggregateStore>) {
        coordinator_with_timeout(backend, config, StdDuration::from_secs(5))
    }

    fn coordinator_with_timeout(
        backend: Arc<dyn StoreBackend>,
        config: IngestConfig,
        timeout: StdDuration,
    ) -> (IngestionCoordinator, Arc<AggregateStore>) {
        let store = Arc::new(AggregateStore::new(backend, timeout, 5));
        let registry = Arc::new(BaselineRegistry::new(Arc::clone(&store)));
        let analyzer = DeviationAnalyzer::new(
            Arc::clone(&store),
            AnalysisConfig {
                include_normal: true,
                ..AnalysisConfig::default()
            },
        );
        let coordinator =
            IngestionCoordinator::new(Arc::clone(&store), registry, analyzer, config).unwrap();
        (coordinator, store)
    }

    fn coordinator() -> (IngestionCoordinator, Arc<AggregateStore>) {
        coordinator_with(Arc::new(InMemoryBackend::new()), IngestConfig::default())
    }

    fn live_record(message: &str, request_id: &str) -> LiveRecord {
        LiveRecord {
            timestamp: None,
            request_id: Some(request_id.to_string()),
            status: NumericField::Number(500),
            level: NumericField::Number(3),
            resource: "/api/user".to_string(),
            ip: "10.0.0.1".to_string(),
            route: "api.user".to_string(),
            module_id: "default".to_string(),
            message: message.to_string(),
        }
    }

    fn payload(version: &str, record: LiveRecord, baselines: &[&str]) -> LivePayload {
        LivePayload {
            version: version.to_string(),
            deploy_started_at: Utc::now() - Duration::minutes(10),
            baseline_versions: baselines.iter().map(|v| v.to_string()).collect(),
            record,
        }
    }

    fn batch_row(version: &str, message: &str, ip: &str) -> BatchRecord {
        BatchRecord {
            version_id: version.to_string(),
            log_hour: "20141120_10".to_string(),
            timestamp: None,
            request_id: None,
            status: NumericField::Text("500".to_string()),
            level: NumericField::Text("3".to_string()),
            resource: "/api/user".to_string(),
            ip: ip.to_string(),
            route: "api.user".to_string(),
            module_id: "default".to_string(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_live_ingest_stores_under_monitoring_scope() {
        let (coordinator, store) = coordinator();
        let result = coordinator
            .ingest_live(payload("v2", live_record("KeyError: 'x'", "r1"), &[]))
            .await;

        assert!(result.outcome.is_stored());
        assert_eq!(result.deviations.len(), 1);
        assert_eq!(result.deviations[0].classification, Classification::New);

        assert_eq!(store.version_errors("MON_v2").await.unwrap().len(), 1);
        assert!(store.version_errors("v2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retried_delivery_counts_once() {
        let (coordinator, store) = coordinator();
        let first = coordinator
            .ingest_live(payload("v2", live_record("Boom 42", "r1"), &[]))
            .await;
        let retry = coordinator
            .ingest_live(payload("v2", live_record("Boom 42", "r1"), &[]))
            .await;

        assert!(first.outcome.is_stored());
        assert!(matches!(retry.outcome, IngestOutcome::Duplicate { .. }));
        assert_eq!(retry.deviations.len(), 1);
        assert_eq!(retry.deviations[0].occurrences, 1);

        let errors = store.version_errors("MON_v2").await.unwrap();
        assert_eq!(errors[0].1, 1);
    }

    #[tokio::test]
    async fn test_known_error_is_normal_against_baseline() {
        let (coordinator, _store) = coordinator();
        let started = Utc::now() - Duration::minutes(10);

        // Previous deploy saw the same error
        coordinator
            .ingest_live(payload("v1", live_record("Boom 1", "a"), &[]))
            .await;
        coordinator
            .register_deploy_baseline("v1", TimeWindow::new(started, Utc::now()))
            .await
            .unwrap();

        let result = coordinator
            .ingest_live(payload("v2", live_record("Boom 2", "b"), &["v1"]))
            .await;
        assert_eq!(result.deviations.len(), 1);
        assert_eq!(result.deviations[0].classification, Classification::Normal);
    }

    #[tokio::test]
    async fn test_batch_rows_are_independent() {
        let (coordinator, store) = coordinator();
        let mut bad = batch_row("v1", "Boom", "10.0.0.2");
        bad.level = NumericField::Text("error".to_string());

        let outcomes = coordinator
            .ingest_batch_all(vec![
                batch_row("v1", "Boom 1", "10.0.0.1"),
                bad,
                batch_row("v1", "Boom 2", "10.0.0.3"),
            ])
            .await;

        assert!(outcomes[0].is_stored());
        assert!(matches!(
            outcomes[1],
            IngestOutcome::Failed {
                error: IngestError::MalformedInput(_)
            }
        ));
        assert!(outcomes[2].is_stored());
        assert_eq!(store.version_errors("v1").await.unwrap()[0].1, 2);
    }

    #[tokio::test]
    async fn test_batch_filters() {
        let config = IngestConfig {
            uri_blocklist: vec!["/api/internal/".to_string()],
            batch_version_pattern: Some(r"^\d{4}-\d{4}-[0-9a-f]{12}$".to_string()),
            ..IngestConfig::default()
        };
        let (coordinator, _store) = coordinator_with(Arc::new(InMemoryBackend::new()), config);

        let outcome = coordinator
            .ingest_batch(batch_row("staging", "Boom", "10.0.0.1"))
            .await;
        assert!(matches!(outcome, IngestOutcome::Skipped { .. }));

        let mut blocked = batch_row("1120-0946-5b0ef0b8a9d2", "Boom", "10.0.0.1");
        blocked.resource = "/api/internal/translate".to_string();
        assert!(matches!(
            coordinator.ingest_batch(blocked).await,
            IngestOutcome::Skipped { .. }
        ));

        let outcome = coordinator
            .ingest_batch(batch_row("1120-0946-5b0ef0b8a9d2", "Boom", "10.0.0.1"))
            .await;
        assert!(matches!(
            outcome,
            IngestOutcome::Stored {
                first_seen: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_same_error_from_both_sources_shares_fingerprint() {
        let (coordinator, _store) = coordinator();
        let live = coordinator
            .ingest_live(payload("v1", live_record("Timeout after 3000ms", "r"), &[]))
            .await;
        let batch = coordinator
            .ingest_batch(batch_row("v1", "Timeout after 2500ms", "10.0.0.9"))
            .await;

        let (
            IngestOutcome::Stored { fingerprint: a, .. },
            IngestOutcome::Stored { fingerprint: b, .. },
        ) = (live.outcome, batch)
        else {
            panic!("both records should be stored");
        };
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_store_failure_allows_retry() {
        let mut backend = MockStoreBackend::new();
        let mut calls = 0;
        backend
            .expect_record_delivery()
            .times(2)
            .returning(move |report, _, _| {
                calls += 1;
                if calls == 1 {
                    Err(StoreError::Unavailable("down".into()))
                } else {
                    Ok(Some(crate::events::RecordReceipt {
                        hour_count: 1,
                        total_count: 1,
                        first_seen: report.version == "v1",
                    }))
                }
            });

        let (coordinator, _store) = coordinator_with(Arc::new(backend), IngestConfig::default());
        let row = batch_row("v1", "Boom", "10.0.0.1");

        let failed = coordinator.ingest_batch(row.clone()).await;
        assert!(matches!(
            failed,
            IngestOutcome::Failed {
                error: IngestError::Store(StoreError::Unavailable(_))
            }
        ));

        let retried = coordinator.ingest_batch(row).await;
        assert!(retried.is_stored());
    }

    fn stored_total(memory: &InMemoryBackend, version: &str) -> u64 {
        memory
            .fingerprint_counts(version, HourBucket(i64::MIN), HourBucket(i64::MAX))
            .unwrap()
            .iter()
            .map(|(_, count)| count)
            .sum()
    }

    #[tokio::test]
    async fn test_timed_out_write_is_not_counted_twice() {
        let memory = Arc::new(InMemoryBackend::new());
        let mut backend = MockStoreBackend::new();
        let shared = Arc::clone(&memory);
        let mut calls = 0;
        backend
            .expect_record_delivery()
            .returning(move |report, limit, delivery| {
                calls += 1;
                // The first two writes outlive the store timeout but still land
                if calls <= 2 {
                    std::thread::sleep(StdDuration::from_millis(200));
                }
                shared.record_delivery(report, limit, delivery)
            });

        let (coordinator, _store) = coordinator_with_timeout(
            Arc::new(backend),
            IngestConfig::default(),
            StdDuration::from_millis(50),
        );
        let row = batch_row("v1", "Boom", "10.0.0.1");

        let first = coordinator.ingest_batch(row.clone()).await;
        let retry = coordinator.ingest_batch(row.clone()).await;
        for outcome in [&first, &retry] {
            assert!(matches!(
                outcome,
                IngestOutcome::Failed {
                    error: IngestError::Store(StoreError::Timeout(_))
                }
            ));
        }

        tokio::time::sleep(StdDuration::from_millis(600)).await;
        assert_eq!(stored_total(&memory, "v1"), 1);

        let settled = coordinator.ingest_batch(row).await;
        assert!(matches!(settled, IngestOutcome::Duplicate { .. }));
        assert_eq!(stored_total(&memory, "v1"), 1);
    }

    #[tokio::test]
    async fn test_import_hour_with_store_failure_stays_open() {
        let memory = Arc::new(InMemoryBackend::new());
        let mut backend = MockStoreBackend::new();

        let shared = Arc::clone(&memory);
        let mut calls = 0;
        backend
            .expect_record_delivery()
            .returning(move |report, limit, delivery| {
                calls += 1;
                if calls == 1 {
                    Err(StoreError::Unavailable("connection refused".into()))
                } else {
                    shared.record_delivery(report, limit, delivery)
                }
            });
        let shared = Arc::clone(&memory);
        backend
            .expect_hour_imported()
            .returning(move |hour| shared.hour_imported(hour));
        let shared = Arc::clone(&memory);
        backend
            .expect_mark_hour_imported()
            .returning(move |hour| shared.mark_hour_imported(hour));

        let (coordinator, _store) = coordinator_with(Arc::new(backend), IngestConfig::default());
        let hour = HourBucket::parse_log_hour("20141120_10").unwrap();
        let rows = vec![batch_row("v1", "Boom", "10.0.0.1")];

        let first = coordinator.import_hour(hour, rows.clone()).await.unwrap();
        assert!(matches!(
            first.as_deref(),
            Some(
                [IngestOutcome::Failed {
                    error: IngestError::Store(StoreError::Unavailable(_))
                }]
            )
        ));
        assert!(!memory.hour_imported(hour).unwrap());

        let rerun = coordinator.import_hour(hour, rows.clone()).await.unwrap();
        assert!(rerun.is_some_and(|outcomes| outcomes[0].is_stored()));
        assert_eq!(stored_total(&memory, "v1"), 1);

        assert!(coordinator.import_hour(hour, rows).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_future_timestamp_is_clamped() {
        let (coordinator, store) = coordinator();
        let mut record = live_record("Boom", "r1");
        record.timestamp = Some(Utc::now() + Duration::days(2));

        let result = coordinator.ingest_live(payload("v3", record, &[])).await;
        let IngestOutcome::Stored { fingerprint, .. } = result.outcome else {
            panic!("expected stored outcome");
        };

        let samples = store.samples("MON_v3", &fingerprint, 1).await.unwrap();
        assert!(samples[0].timestamp <= Utc::now());
    }

    #[tokio::test]
    async fn test_import_hour_runs_once() {
        let (coordinator, _store) = coordinator();
        let hour = HourBucket::parse_log_hour("20141120_10").unwrap();

        let first = coordinator
            .import_hour(hour, vec![batch_row("v1", "Boom", "10.0.0.1")])
            .await
            .unwrap();
        assert_eq!(first.map(|o| o.len()), Some(1));

        let second = coordinator
            .import_hour(hour, vec![batch_row("v1", "Boom", "10.0.0.2")])
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_dedup_key_depends_on_content() {
        let a = batch_row("v1", "Boom", "10.0.0.1");
        let b = batch_row("v1", "Boom", "10.0.0.2");
        assert_eq!(dedup_key("batch", "v1", &a), dedup_key("batch", "v1", &a));
        assert_ne!(dedup_key("batch", "v1", &a), dedup_key("batch", "v1", &b));
        assert_ne!(dedup_key("batch", "v1", &a), dedup_key("live", "v1", &a));
    }
}
