//! Log Classifier
//!
//! Turns a raw output line into a structured [`ClassifiedLine`] and infers a
//! [`StatusHint`] from its text. Everything here is pure; the registry decides
//! whether a hint is applied.
//!
//! Structured lines follow the pino convention used by the API services:
//! `{"level":30,"time":1704067200000,"name":"http","msg":"listening"}`.

use chrono::{DateTime, Local, TimeZone};
use serde_json::{Map, Value};

use crate::ansi::strip_ansi_codes;
use crate::types::{LogLevel, ServiceStatus, StatusHint};

const BUILDING_KEYWORDS: &[&str] = &["compiling", "building", "starting"];
const RUNNING_KEYWORDS: &[&str] = &[
    "ready",
    "started",
    "listening",
    "build successful",
    "compiled successfully",
];
const ERROR_KEYWORDS: &[&str] = &["error", "failed"];

/// A classified output line
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedLine {
    pub message: String,
    pub level: LogLevel,
    /// Timestamp carried by the line itself, if any
    pub timestamp: Option<DateTime<Local>>,
    pub source_label: Option<String>,
}

/// Classify a raw output line.
///
/// A line that is a single JSON object with a `msg` or `message` string
/// field is read as a structured record. Anything else is ANSI-stripped and
/// kept verbatim at `fallback` level.
pub fn classify(raw: &str, fallback: LogLevel) -> ClassifiedLine {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
            if let Some(line) = classify_structured(&obj, fallback) {
                return line;
            }
        }
    }

    ClassifiedLine {
        message: strip_ansi_codes(raw.trim_end_matches(['\r', '\n'])),
        level: fallback,
        timestamp: None,
        source_label: None,
    }
}

fn classify_structured(obj: &Map<String, Value>, fallback: LogLevel) -> Option<ClassifiedLine> {
    let message = obj
        .get("msg")
        .or_else(|| obj.get("message"))
        .and_then(Value::as_str)?;

    let level = match obj.get("level") {
        Some(Value::Number(n)) => n
            .as_f64()
            .map(|severity| level_from_severity(severity, fallback))
            .unwrap_or(fallback),
        Some(Value::String(name)) => LogLevel::parse(name).unwrap_or(fallback),
        _ => fallback,
    };

    let timestamp = obj.get("time").and_then(parse_time);
    let source_label = obj
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(ClassifiedLine {
        message: strip_ansi_codes(message),
        level,
        timestamp,
        source_label,
    })
}

/// Map a numeric pino severity onto a [`LogLevel`]
pub fn level_from_severity(severity: f64, fallback: LogLevel) -> LogLevel {
    if severity >= 50.0 {
        LogLevel::Error
    } else if severity >= 40.0 {
        LogLevel::Warn
    } else if severity >= 30.0 {
        LogLevel::Info
    } else {
        fallback
    }
}

/// `time` is either an RFC 3339 string or epoch milliseconds
fn parse_time(value: &Value) -> Option<DateTime<Local>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Local)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Local.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Infer a status hint from message text.
///
/// Keyword groups are checked in order building, running, error; the first
/// group with a match wins.
pub fn infer_status_hint(message: &str) -> Option<StatusHint> {
    let lower = message.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if contains_any(BUILDING_KEYWORDS) {
        Some(StatusHint::Building)
    } else if contains_any(RUNNING_KEYWORDS) {
        Some(StatusHint::Running)
    } else if contains_any(ERROR_KEYWORDS) {
        Some(StatusHint::Error)
    } else {
        None
    }
}

/// Status after applying `hint` to `current`.
///
/// Hints only move a service that is still starting or building. A running
/// service never regresses on log noise, and stopped/error services are
/// never revived by stray output.
pub fn next_status(current: ServiceStatus, hint: Option<StatusHint>) -> ServiceStatus {
    match hint {
        Some(hint) if current.accepts_hints() => hint.target_status(),
        _ => current,
    }
}
