use crate::baseline::BaselineEntry;
use crate::config::AnalysisConfig;
use crate::error::StoreError;
use crate::events::{Fingerprint, TimeWindow};
use crate::store::AggregateStore;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// How a fingerprint's presence or rate compares with the baselines
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Absent from every baseline
    New,
    /// Rate ratio above the threshold with enough occurrences to trust it
    Elevated,
    Normal,
}

/// Deviation of one fingerprint within a candidate window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationResult {
    pub fingerprint: Fingerprint,
    pub classification: Classification,
    /// Occurrences in the candidate window
    pub occurrences: u64,
    /// Occurrences per hour in the candidate window
    pub current_rate: f64,
    /// Mean per-hour rate across the baselines; `None` for new errors
    pub baseline_rate: Option<f64>,
    /// `current_rate / max(baseline_rate, epsilon)`; `None` for new errors
    pub rate_ratio: Option<f64>,
    /// Fewer occurrences than the confidence floor
    pub low_confidence: bool,
}

/// Compares a version's error counts against deploy baselines
///
/// Analysis is a read-only computation: it never writes to the store, and two
/// calls over unchanged data return identical results.
pub struct DeviationAnalyzer {
    store: Arc<AggregateStore>,
    config: AnalysisConfig,
}

impl DeviationAnalyzer {
    pub fn new(store: Arc<AggregateStore>, config: AnalysisConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Classify every fingerprint observed for `version` in `candidate_window`
    ///
    /// Results are ordered new first (most occurrences first), then elevated
    /// by descending rate ratio, then normal. Normal results are dropped unless
    /// `include_normal` is configured. A version with no data yields an empty
    /// sequence.
    ///
    /// # Arguments
    ///
    /// * `version` - Version whose occurrences are examined
    /// * `candidate_window` - Window of the candidate deploy
    /// * `baselines` - Known-good snapshots to compare against
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be read in time.
    pub async fn analyze(
        &self,
        version: &str,
        candidate_window: TimeWindow,
        baselines: &[BaselineEntry],
    ) -> Result<Vec<DeviationResult>, StoreError> {
        let counts = self
            .store
            .fingerprint_counts(version, candidate_window)
            .await?;

        if counts.is_empty() {
            debug!("No occurrences for {} in candidate window", version);
            return Ok(Vec::new());
        }

        let results = classify(&counts, candidate_window.hours(), baselines, &self.config);

        for result in &results {
            match result.classification {
                Classification::New => warn!(
                    "New error {} on {}: {} occurrences",
                    result.fingerprint, version, result.occurrences
                ),
                Classification::Elevated => warn!(
                    "Elevated error {} on {}: {:.2}/h vs baseline {:.2}/h",
                    result.fingerprint,
                    version,
                    result.current_rate,
                    result.baseline_rate.unwrap_or(0.0)
                ),
                Classification::Normal => {}
            }
        }

        Ok(results)
    }
}

/// Classify fingerprint counts observed over `hours` against the baselines
pub fn classify(
    counts: &[(Fingerprint, u64)],
    hours: f64,
    baselines: &[BaselineEntry],
    config: &AnalysisConfig,
) -> Vec<DeviationResult> {
    let mut results: Vec<DeviationResult> = counts
        .iter()
        .filter(|(_, occurrences)| *occurrences > 0)
        .map(|(fingerprint, occurrences)| {
            classify_one(fingerprint, *occurrences, hours, baselines, config)
        })
        .filter(|r| config.include_normal || r.classification != Classification::Normal)
        .collect();

    results.sort_by(compare_severity);
    results
}

fn classify_one(
    fingerprint: &Fingerprint,
    occurrences: u64,
    hours: f64,
    baselines: &[BaselineEntry],
    config: &AnalysisConfig,
) -> DeviationResult {
    let current_rate = occurrences as f64 / hours;
    let low_confidence = occurrences < config.min_occurrences;

    if !baselines.iter().any(|b| b.contains(fingerprint)) {
        return DeviationResult {
            fingerprint: fingerprint.clone(),
            classification: Classification::New,
            occurrences,
            current_rate,
            baseline_rate: None,
            rate_ratio: None,
            low_confidence,
        };
    }

    // Baselines that never saw the fingerprint count as a zero rate
    let baseline_rate =
        baselines.iter().map(|b| b.rate_of(fingerprint)).sum::<f64>() / baselines.len() as f64;
    let rate_ratio = current_rate / baseline_rate.max(config.epsilon);

    let classification = if rate_ratio > config.rate_ratio_threshold && !low_confidence {
        Classification::Elevated
    } else {
        Classification::Normal
    };

    DeviationResult {
        fingerprint: fingerprint.clone(),
        classification,
        occurrences,
        current_rate,
        baseline_rate: Some(baseline_rate),
        rate_ratio: Some(rate_ratio),
        low_confidence,
    }
}

fn compare_severity(a: &DeviationResult, b: &DeviationResult) -> Ordering {
    a.classification
        .cmp(&b.classification)
        .then_with(|| match a.classification {
            Classification::New => b.occurrences.cmp(&a.occurrences),
            _ => b
                .rate_ratio
                .unwrap_or(0.0)
                .total_cmp(&a.rate_ratio.unwrap_or(0.0)),
        })
        .then_with(|| a.fingerprint.cmp(&b.fingerprint))
}
