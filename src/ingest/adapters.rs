//! Per-source adapters from raw ingestion payloads to `NormalizedRecord`
//!
//! The deploy-time scraper and the warehouse export deliver differently shaped
//! rows. Each source gets one pure function mapping its raw shape onto the
//! normalized record; nothing downstream knows which source produced it.

use crate::error::IngestError;
use crate::events::{HourBucket, NormalizedRecord, Severity, Source, Timestamp};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

// API calls from the browser carry a cache-busting `_=<millis>` parameter
#[allow(clippy::expect_used)]
static RE_CACHE_BUST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([?&])_=\d+").expect("valid regex"));

/// A numeric field that may arrive as a JSON number or as a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericField {
    Number(i64),
    Text(String),
}

impl NumericField {
    fn parse(&self) -> Option<i64> {
        match self {
            NumericField::Number(n) => Some(*n),
            NumericField::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<i64> for NumericField {
    fn from(value: i64) -> Self {
        NumericField::Number(value)
    }
}

/// One error log line scraped from the currently deploying version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveRecord {
    /// Defaults to the time of ingestion when absent
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub request_id: Option<String>,
    pub status: NumericField,
    pub level: NumericField,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub module_id: String,
    pub message: String,
}

/// One error row exported from the hourly log warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub version_id: String,
    /// Hour label of the export, e.g. `20141120_10`
    pub log_hour: String,
    /// Defaults to the start of `log_hour` when absent
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub request_id: Option<String>,
    pub status: NumericField,
    pub level: NumericField,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, alias = "elog_url_route")]
    pub route: String,
    #[serde(default)]
    pub module_id: String,
    pub message: String,
}

/// Result of adapting a raw row
#[derive(Debug, Clone, PartialEq)]
pub enum Adapted {
    Record(NormalizedRecord),
    /// Well-formed, but below the tracked severity
    Ignored(String),
}

/// Adapt a scraped log line for `version`
///
/// # Errors
///
/// Returns `IngestError::MalformedInput` when required fields are missing or
/// unparseable.
pub fn adapt_live(version: &str, raw: &LiveRecord, now: Timestamp) -> Result<Adapted, IngestError> {
    let common = CommonFields::parse(&raw.status, &raw.level, &raw.message)?;
    let version = require_version(version)?;

    Ok(common.into_adapted(|severity, status| NormalizedRecord {
        version,
        timestamp: raw.timestamp.unwrap_or(now),
        message: raw.message.clone(),
        error_class: None,
        stack_trace: None,
        status,
        severity,
        route: raw.route.clone(),
        resource: strip_cache_buster(&raw.resource),
        ip: raw.ip.clone(),
        module: raw.module_id.clone(),
        source: Source::Live,
    }))
}

/// Adapt a warehouse row
///
/// # Errors
///
/// Returns `IngestError::MalformedInput` when required fields are missing or
/// unparseable, including an invalid `log_hour` label.
pub fn adapt_batch(raw: &BatchRecord) -> Result<Adapted, IngestError> {
    let common = CommonFields::parse(&raw.status, &raw.level, &raw.message)?;
    let version = require_version(&raw.version_id)?;
    let hour = HourBucket::parse_log_hour(&raw.log_hour).ok_or_else(|| {
        IngestError::MalformedInput(format!("invalid log_hour '{}'", raw.log_hour))
    })?;

    Ok(common.into_adapted(|severity, status| NormalizedRecord {
        version,
        timestamp: raw.timestamp.unwrap_or_else(|| hour.start()),
        message: raw.message.clone(),
        error_class: None,
        stack_trace: None,
        status,
        severity,
        route: raw.route.clone(),
        resource: strip_cache_buster(&raw.resource),
        ip: raw.ip.clone(),
        module: raw.module_id.clone(),
        source: Source::Batch,
    }))
}

/// Remove cache-busting `_=<digits>` query parameters from a resource
pub fn strip_cache_buster(resource: &str) -> String {
    RE_CACHE_BUST.replace_all(resource, "$1").into_owned()
}

struct CommonFields {
    status: u16,
    level: i64,
}

impl CommonFields {
    fn parse(
        status: &NumericField,
        level: &NumericField,
        message: &str,
    ) -> Result<Self, IngestError> {
        let status = status
            .parse()
            .and_then(|s| u16::try_from(s).ok())
            .ok_or_else(|| IngestError::MalformedInput(format!("invalid status {:?}", status)))?;
        let level = level
            .parse()
            .filter(|l| *l >= 0)
            .ok_or_else(|| IngestError::MalformedInput(format!("invalid level {:?}", level)))?;
        if message.trim().is_empty() {
            return Err(IngestError::MalformedInput("empty message".to_string()));
        }
        Ok(Self { status, level })
    }

    fn into_adapted(self, build: impl FnOnce(Severity, u16) -> NormalizedRecord) -> Adapted {
        let level = u8::try_from(self.level).unwrap_or(u8::MAX);
        match Severity::from_level(level) {
            Some(severity) => Adapted::Record(build(severity, self.status)),
            None => Adapted::Ignored(format!("log level {} is below ERROR", self.level)),
        }
    }
}

fn require_version(version: &str) -> Result<String, IngestError> {
    let version = version.trim();
    if version.is_empty() {
        return Err(IngestError::MalformedInput("missing version".to_string()));
    }
    Ok(version.to_string())
}
