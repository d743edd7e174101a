//! Stable identities for error reports
//!
//! Two reports are "the same error" when their (error class, normalized title,
//! top stack frame) triples match. Normalization replaces the volatile parts of
//! a message (numbers, UUIDs, addresses, timestamps, IPs, long identifiers) with
//! fixed placeholders so that occurrences from either ingestion path collapse
//! onto one fingerprint.

use crate::events::{Fingerprint, NormalizedRecord};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Marker inserted by the application when a warning is promoted to an error
const PROMOTION_PREFIX: &str = "[promoted from WARNING] ";

/// Number of hex characters kept from the SHA-256 digest
const FINGERPRINT_LEN: usize = 16;

#[allow(clippy::expect_used)]
static RE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("valid regex")
});
#[allow(clippy::expect_used)]
static RE_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("valid regex")
});
#[allow(clippy::expect_used)]
static RE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").expect("valid regex"));
#[allow(clippy::expect_used)]
static RE_IPV4: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("valid regex"));
#[allow(clippy::expect_used)]
static RE_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.+-]+@[\w-]+(?:\.[\w-]+)+").expect("valid regex"));
#[allow(clippy::expect_used)]
static RE_HEX_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{8,}\b").expect("valid regex"));
#[allow(clippy::expect_used)]
static RE_LONG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z0-9_-]{24,}\b").expect("valid regex"));
#[allow(clippy::expect_used)]
static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));
#[allow(clippy::expect_used)]
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

#[allow(clippy::expect_used)]
static RE_EXCEPTION_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][\w.]*(?:Error|Exception|Fault|Exit|Interrupt))\b")
        .expect("valid regex")
});
#[allow(clippy::expect_used)]
static RE_PYTHON_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*File "([^"]*)", line (\d*), in (.*)$"#).expect("valid regex")
});
#[allow(clippy::expect_used)]
static RE_AT_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?:(.+?)\s+\()?([^()\s]+?):(\d+)(?::\d+)?\)?\s*$")
        .expect("valid regex")
});
// Deployed file paths embed the version directory, e.g.
// /base/data/home/apps/s~app/1029-2305-f48a12e2b9ba.379742046073152437/api/errors.py
#[allow(clippy::expect_used)]
static RE_VERSION_PATH_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*\d{4}-\d{4}-[a-f0-9]{12}\.\d+/").expect("valid regex")
});

/// One parsed stack frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub function: String,
    pub line: Option<u32>,
}

impl StackFrame {
    /// Identity of the frame; line numbers are deliberately excluded
    pub fn key(&self) -> String {
        format!("{}:{}", self.file, self.function)
    }
}

/// Full derived identity of an error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub fingerprint: Fingerprint,
    pub error_class: String,
    /// Title with volatile substrings replaced by placeholders
    pub template: String,
    /// Human-readable title, as reported
    pub title: String,
    pub top_frame: Option<StackFrame>,
    /// Stack trace text the frames were parsed from
    pub stack_trace: String,
}

/// Derives fingerprints from normalized records
///
/// Stateless and deterministic; never fails. A record without a usable stack
/// trace or exception class still yields a (less specific) fingerprint.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter;

impl Fingerprinter {
    pub fn new() -> Self {
        Self
    }

    pub fn fingerprint(&self, record: &NormalizedRecord) -> Fingerprint {
        self.signature(record).fingerprint
    }

    /// Compute the full signature for a record
    pub fn signature(&self, record: &NormalizedRecord) -> ErrorSignature {
        let title = extract_title(&record.message);
        let stack_trace = match &record.stack_trace {
            Some(trace) if !trace.trim().is_empty() => trace.clone(),
            _ => message_body(&record.message),
        };

        let error_class = record
            .error_class
            .as_deref()
            .map(str::trim)
            .filter(|class| !class.is_empty())
            .map(str::to_string)
            .or_else(|| detect_exception_class(&title, &stack_trace))
            .unwrap_or_else(|| format!("{} {}", record.severity.label(), record.status));

        let template = normalize_message(&title);
        let top_frame = top_frame(&stack_trace);
        let fingerprint = hash_triple(&error_class, &template, top_frame.as_ref());

        ErrorSignature {
            fingerprint,
            error_class,
            template,
            title,
            top_frame,
            stack_trace,
        }
    }
}

/// Pick the human-readable title out of a (possibly multi-line) message
///
/// The first line is usually the visible error. When it is empty, the
/// interesting part is found on the last line instead.
pub fn extract_title(message: &str) -> String {
    let first = message.lines().next().unwrap_or("");
    let first = first.strip_prefix(PROMOTION_PREFIX).unwrap_or(first).trim();
    if !first.is_empty() {
        return first.to_string();
    }

    message
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
        .to_string()
}

/// Replace high-cardinality substrings with fixed placeholders
pub fn normalize_message(text: &str) -> String {
    let normalized = RE_UUID.replace_all(text, "<uuid>");
    let normalized = RE_TIMESTAMP.replace_all(&normalized, "<ts>");
    let normalized = RE_ADDRESS.replace_all(&normalized, "<addr>");
    let normalized = RE_IPV4.replace_all(&normalized, "<ip>");
    let normalized = RE_EMAIL.replace_all(&normalized, "<email>");
    let normalized = RE_HEX_RUN.replace_all(&normalized, |caps: &Captures| {
        if caps[0].bytes().all(|b| b.is_ascii_digit()) {
            "<n>".to_string()
        } else {
            "<hex>".to_string()
        }
    });
    let normalized = RE_LONG_TOKEN.replace_all(&normalized, |caps: &Captures| {
        if caps[0].bytes().any(|b| b.is_ascii_digit()) {
            "<id>".to_string()
        } else {
            caps[0].to_string()
        }
    });
    let normalized = RE_NUMBER.replace_all(&normalized, "<n>");
    let normalized = RE_WHITESPACE.replace_all(&normalized, " ");
    normalized.trim().to_string()
}

/// Parse every recognizable frame out of a stack trace, in text order
pub fn parse_stack(trace: &str) -> Vec<StackFrame> {
    trace
        .lines()
        .filter_map(|line| {
            if let Some(caps) = RE_PYTHON_FRAME.captures(line) {
                return Some(StackFrame {
                    file: strip_version_prefix(&caps[1]),
                    function: caps[3].trim().to_string(),
                    line: caps[2].parse().ok(),
                });
            }
            // Truncated lines fall through and are ignored
            RE_AT_FRAME.captures(line).map(|caps| StackFrame {
                file: strip_version_prefix(&caps[2]),
                function: caps
                    .get(1)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_else(|| "<anonymous>".to_string()),
                line: caps[3].parse().ok(),
            })
        })
        .collect()
}

/// The frame where the error was raised
///
/// Python tracebacks list the innermost frame last; `at ...` style traces list
/// it first.
pub fn top_frame(trace: &str) -> Option<StackFrame> {
    let python_style = trace.lines().any(|line| RE_PYTHON_FRAME.is_match(line));
    let mut frames = parse_stack(trace);
    if python_style {
        frames.pop()
    } else if frames.is_empty() {
        None
    } else {
        Some(frames.swap_remove(0))
    }
}

fn message_body(message: &str) -> String {
    message.lines().skip(1).collect::<Vec<_>>().join("\n")
}

fn strip_version_prefix(path: &str) -> String {
    RE_VERSION_PATH_PREFIX.replace(path, "").into_owned()
}

fn detect_exception_class(title: &str, stack_trace: &str) -> Option<String> {
    let last_line = stack_trace
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");

    [title, last_line]
        .iter()
        .find_map(|line| RE_EXCEPTION_CLASS.captures(line).map(|c| c[1].to_string()))
}

fn hash_triple(error_class: &str, template: &str, frame: Option<&StackFrame>) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(error_class.as_bytes());
    hasher.update([0x1f]);
    hasher.update(template.as_bytes());
    hasher.update([0x1f]);
    if let Some(frame) = frame {
        hasher.update(frame.key().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    Fingerprint::new(&digest[..FINGERPRINT_LEN])
}
