//! Core data types shared by every component of the error monitor
//!
//! This module defines the error report recorded for each occurrence, the
//! fingerprint identity, and the time types (hour buckets and windows) used to
//! aggregate occurrences.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Version prefix that keeps deploy-time occurrences apart from warehouse rows
pub const MONITORING_VERSION_PREFIX: &str = "MON_";

/// Version name under which live deploy monitoring data is stored
///
/// Warehouse imports eventually cover the same requests a live scrape saw, so
/// live occurrences live in their own namespace to avoid double counting.
pub fn monitoring_version(version: &str) -> String {
    format!("{}{}", MONITORING_VERSION_PREFIX, version)
}

/// Stable identity for one logical error
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Severity of an error report
///
/// Only the two error levels of the application logs are tracked: 3 (ERROR)
/// and 4 (CRITICAL).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Critical,
}

impl Severity {
    /// Map a numeric application log level onto a tracked severity
    ///
    /// Returns `None` for levels below ERROR.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0..=2 => None,
            3 => Some(Severity::Error),
            _ => Some(Severity::Critical),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Which ingestion path produced a report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Deploy-time log scraper
    Live,
    /// Hourly warehouse export
    Batch,
}

/// Aggregation granularity: whole hours since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HourBucket(pub i64);

impl HourBucket {
    pub fn of(timestamp: Timestamp) -> Self {
        Self(timestamp.timestamp().div_euclid(3600))
    }

    /// Start of the hour this bucket covers
    pub fn start(&self) -> Timestamp {
        DateTime::from_timestamp(self.0 * 3600, 0).unwrap_or_default()
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Parse a warehouse log-hour label such as `20141120_10`
    pub fn parse_log_hour(label: &str) -> Option<Self> {
        let (date, hour) = label.trim().split_once('_')?;
        let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
        let hour: u32 = hour.parse().ok()?;
        let start = date.and_hms_opt(hour, 0, 0)?.and_utc();
        Some(Self::of(start))
    }
}

impl fmt::Display for HourBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start().format("%Y%m%d_%H"))
    }
}

/// A closed time range over which occurrences are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    /// Create a window; bounds given in the wrong order are swapped
    pub fn new(a: Timestamp, b: Timestamp) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    /// Window covering the whole hours from `first` through `last`
    pub fn from_buckets(first: HourBucket, last: HourBucket) -> Self {
        let window = Self::new(first.start(), last.start());
        Self {
            start: window.start,
            end: window.end + Duration::hours(1),
        }
    }

    /// Window of `duration` ending at `end`
    pub fn trailing(end: Timestamp, duration: Duration) -> Self {
        Self::new(end - duration, end)
    }

    pub fn first_bucket(&self) -> HourBucket {
        HourBucket::of(self.start)
    }

    /// Last hour bucket the window reaches into
    ///
    /// The end is exclusive: a window ending exactly on an hour boundary does
    /// not reach into the hour that starts there.
    pub fn last_bucket(&self) -> HourBucket {
        if self.end > self.start {
            HourBucket::of(self.end - Duration::nanoseconds(1))
        } else {
            self.first_bucket()
        }
    }

    pub fn contains(&self, bucket: HourBucket) -> bool {
        bucket >= self.first_bucket() && bucket <= self.last_bucket()
    }

    /// Length of the window in hours, never less than one minute
    pub fn hours(&self) -> f64 {
        let seconds = (self.end - self.start).num_seconds().max(60);
        seconds as f64 / 3600.0
    }
}

/// One observed error occurrence
///
/// Created by the ingestion coordinator and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub fingerprint: Fingerprint,
    pub version: String,
    /// Full precision occurrence time
    pub timestamp: Timestamp,
    /// First meaningful line of the error message
    pub title: String,
    pub error_class: String,
    pub status: u16,
    pub severity: Severity,
    pub route: String,
    pub resource: String,
    pub ip: String,
    pub module: String,
    pub stack_trace: String,
    pub source: Source,
}

impl ErrorReport {
    pub fn bucket(&self) -> HourBucket {
        HourBucket::of(self.timestamp)
    }
}

/// Source-agnostic error record produced by the per-source ingestion adapters
///
/// The fingerprinter and the aggregate store only ever see this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedRecord {
    pub version: String,
    pub timestamp: Timestamp,
    /// Full error message, possibly followed by a stack trace
    pub message: String,
    /// Exception class when the source reports it separately
    pub error_class: Option<String>,
    /// Stack trace when the source reports it separately from the message
    pub stack_trace: Option<String>,
    pub status: u16,
    pub severity: Severity,
    pub route: String,
    pub resource: String,
    pub ip: String,
    pub module: String,
    pub source: Source,
}

/// Result of recording one report in the aggregate store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReceipt {
    /// Counter value for (version, fingerprint, hour) after the increment
    pub hour_count: u64,
    /// Total for (version, fingerprint) across all hours after the increment
    pub total_count: u64,
    /// No earlier occurrence of this fingerprint existed in any version
    pub first_seen: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hour_bucket_truncates_to_hour() {
        let ts = Utc.with_ymd_and_hms(2014, 11, 20, 10, 59, 59).unwrap();
        let bucket = HourBucket::of(ts);
        assert_eq!(bucket.start(), Utc.with_ymd_and_hms(2014, 11, 20, 10, 0, 0).unwrap());
        assert_eq!(bucket.to_string(), "20141120_10");
    }

    #[test]
    fn test_parse_log_hour() {
        let bucket = HourBucket::parse_log_hour("20141120_10").unwrap();
        assert_eq!(bucket.to_string(), "20141120_10");
        assert_eq!(bucket.next().to_string(), "20141120_11");

        assert!(HourBucket::parse_log_hour("20141120").is_none());
        assert!(HourBucket::parse_log_hour("20141120_25").is_none());
        assert!(HourBucket::parse_log_hour("2014-11-20_10").is_none());
    }

    #[test]
    fn test_pre_epoch_bucket_rounds_down() {
        let ts = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(HourBucket::of(ts), HourBucket(-1));
    }

    #[test]
    fn test_time_window_orders_bounds() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let window = TimeWindow::new(a, b);
        assert_eq!(window.start, b);
        assert_eq!(window.end, a);
        assert!((window.hours() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_window_bucket_membership() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let window = TimeWindow::trailing(start + Duration::hours(1), Duration::hours(1));
        assert!(window.contains(HourBucket::of(start)));
        assert!(window.contains(HourBucket::of(start + Duration::hours(1))));
        assert!(!window.contains(HourBucket::of(start - Duration::hours(1))));
    }

    #[test]
    fn test_time_window_minimum_duration() {
        let now = Utc::now();
        let window = TimeWindow::new(now, now);
        assert!((window.hours() - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_from_buckets_covers_whole_hours() {
        let first = HourBucket::parse_log_hour("20240101_10").unwrap();
        let window = TimeWindow::from_buckets(first, first);
        assert_eq!(window.first_bucket(), first);
        assert_eq!(window.last_bucket(), first);
        assert!((window.hours() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_end_is_exclusive() {
        let ten = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let window = TimeWindow::new(ten, ten + Duration::hours(1));
        assert_eq!(window.first_bucket(), HourBucket::of(ten));
        assert_eq!(window.last_bucket(), HourBucket::of(ten));
        assert!(!window.contains(HourBucket::of(ten + Duration::minutes(90))));

        // One second past the boundary reaches into the next hour
        let longer = TimeWindow::new(ten, ten + Duration::hours(1) + Duration::seconds(1));
        assert_eq!(longer.last_bucket(), HourBucket::of(ten).next());
    }

    #[test]
    fn test_severity_from_level() {
        assert_eq!(Severity::from_level(2), None);
        assert_eq!(Severity::from_level(3), Some(Severity::Error));
        assert_eq!(Severity::from_level(4), Some(Severity::Critical));
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_monitoring_version() {
        assert_eq!(monitoring_version("0810-0511-eef125daa7"), "MON_0810-0511-eef125daa7");
    }

    #[test]
    fn test_severity_serialization() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(serde_json::to_string(&Source::Batch).unwrap(), "\"batch\"");
    }
}
