//! Parsing of aria CLI output lines.
//!
//! The CLI logs lines such as
//! `2026-02-12 15:57:22,438 [4242] [INFO] [uploader:88] - [vrs:/d/a.vrs] Uploading with chunk_size 8.00 MB | 12.345%`
//! from which a stage, a percentage and a readable message are extracted.

use once_cell::sync::Lazy;
use regex_lite::{Captures, Regex};

use super::error::ConversionError;
use crate::job::JobStage;

static PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?|\.\d+)\s*%").unwrap());

static HASHING: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bHashing\b").unwrap());
static HEALTH_CHECK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bIndex\b|Health(?:\s|_|-)?check").unwrap());
static DOWNLOADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:Downloaded|Downloading)\b").unwrap());
static ENCRYPTING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:Encrypting|Encryption)\b").unwrap());
static UPLOADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bUploading\b").unwrap());

static LOG_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2},\d+\s+\[\d+\]\s+\[\w+\]\s+\[[^\]]+\]\s+-\s+",
    )
    .unwrap()
});
static TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2},\d+\s+").unwrap());
static VRS_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[vrs:[^\]]+\]\s*").unwrap());
static CHUNK_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Uploading\s+with\s+chunk_size\s+[0-9.]+\s+MB\s+\|\s+").unwrap()
});

static TRANSIENT_HTTP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:408|429|5\d\d)\b").unwrap());

const AUTH_MARKERS: [&str; 6] = [
    "authentication failed",
    "invalid credentials",
    "incorrect password",
    "login failed",
    "unauthorized",
    "not authorized",
];

const BUSY_MARKERS: [&str; 6] = [
    "service busy",
    "try again",
    "too many requests",
    "rate limit",
    "temporarily unavailable",
    "service unavailable",
];

const NETWORK_MARKERS: [&str; 9] = [
    "connection reset",
    "connection refused",
    "connection aborted",
    "connection error",
    "timed out",
    "timeout",
    "network is unreachable",
    "name resolution",
    "broken pipe",
];

/// What one output line says.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub stage: Option<JobStage>,
    /// Last percentage on the line, truncated to two decimals.
    pub percent: Option<f64>,
    /// Cleaned, display-ready text.
    pub message: String,
    pub is_error: bool,
}

pub fn parse_line(line: &str) -> ParsedLine {
    ParsedLine {
        stage: extract_stage(line),
        percent: parse_percentage(line),
        message: truncate_percentages(&clean_message(line)),
        is_error: is_error_line(line),
    }
}

/// Maps a line to the stage it reports on. Checked in a fixed order, so a
/// line mentioning several keywords resolves to the first match.
pub fn extract_stage(line: &str) -> Option<JobStage> {
    if HASHING.is_match(line) {
        Some(JobStage::Hashing)
    } else if HEALTH_CHECK.is_match(line) {
        Some(JobStage::HealthCheck)
    } else if DOWNLOADING.is_match(line) {
        Some(JobStage::FetchingOutputs)
    } else if ENCRYPTING.is_match(line) {
        Some(JobStage::Encrypting)
    } else if UPLOADING.is_match(line) {
        Some(JobStage::UploadingToService)
    } else {
        None
    }
}

pub fn parse_percentage(line: &str) -> Option<f64> {
    let last = PERCENT.captures_iter(line).last()?;
    let value: f64 = last.get(1)?.as_str().parse().ok()?;
    Some(truncate_percent(value))
}

/// Truncates (never rounds) to two decimals.
pub fn truncate_percent(value: f64) -> f64 {
    (value * 100.0).trunc() / 100.0
}

pub fn truncate_percentages(line: &str) -> String {
    PERCENT
        .replace_all(line, |caps: &Captures| match caps[1].parse::<f64>() {
            Ok(value) => format!("{:.2}%", truncate_percent(value)),
            Err(_) => caps[0].to_string(),
        })
        .into_owned()
}

pub fn clean_message(line: &str) -> String {
    let stripped = LOG_PREFIX.replace(line, "");
    let stripped = if stripped == line {
        TIMESTAMP.replace(line, "")
    } else {
        stripped
    };
    let without_tag = VRS_TAG.replace_all(&stripped, "");
    let rewritten = CHUNK_SIZE.replace_all(&without_tag, "Uploading: ");
    rewritten.trim().to_string()
}

pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("error") || lower.contains("exception")
}

/// Classifies a non-zero CLI exit from its captured output.
pub fn classify_failure(exit_code: Option<i32>, output: &str) -> ConversionError {
    let lower = output.to_lowercase();
    let reason = failure_reason(exit_code, output);

    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        ConversionError::AuthenticationFailed { reason }
    } else if BUSY_MARKERS.iter().any(|m| lower.contains(m)) {
        ConversionError::service_busy(reason)
    } else if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        ConversionError::network(reason)
    } else if TRANSIENT_HTTP.is_match(output) {
        ConversionError::process_failed(exit_code, reason, true)
    } else {
        ConversionError::process_failed(exit_code, reason, false)
    }
}

fn failure_reason(exit_code: Option<i32>, output: &str) -> String {
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let detail = lines
        .iter()
        .rev()
        .find(|l| is_error_line(l))
        .or_else(|| lines.last())
        .map(|l| clean_message(l))
        .unwrap_or_else(|| "no output".to_string());
    match exit_code {
        Some(code) => format!("Return code: {}: {}", code, detail),
        None => format!("terminated by signal: {}", detail),
    }
}

/// Renders a command line for logging with the password value masked.
pub fn masked_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            parts.push("***".to_string());
            mask_next = false;
            continue;
        }
        mask_next = arg == "--password";
        parts.push(arg.clone());
    }
    parts.join(" ")
}
