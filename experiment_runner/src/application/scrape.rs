// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Scrape Metadata
//!
//! The per-run JSON document downstream ETL consumes. Experiment stdout
//! lines that parse as a single JSON object are merged into the document;
//! everything else passes through to the output log verbatim. The document
//! is written as `scrape-<host>-<base62-ts>.json`, where the timestamp is
//! monotonically increasing per process so multi-host aggregation never
//! collides or reorders.
//!
//! A scrape is written even on catastrophic failure; it then carries the
//! request digest, the host, and the kv-formatted error chain.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use experiment_runner_domain::RunnerError;
use serde_json::{Map, Value};

const BASE62_ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Encodes an integer in base62.
pub fn base62_encode(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE62_ALPHABET[(value % 62) as usize]);
        value /= 62;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

// Last issued stamp; never re-issued even when the clock stalls.
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Next scrape timestamp: UNIX seconds, bumped past the previous issue so
/// stamps from one process are strictly increasing.
pub fn next_scrape_stamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut prev = LAST_STAMP.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(prev + 1);
        match LAST_STAMP.compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

/// Accumulates one run's merged metadata document.
pub struct ScrapeDocument {
    host: String,
    merged: Map<String, Value>,
}

impl ScrapeDocument {
    pub fn new(host: impl Into<String>, experiment_key: &str, digest: &str) -> Self {
        let host = host.into();
        let mut merged = Map::new();
        merged.insert("experiment".to_string(), Value::String(experiment_key.to_string()));
        merged.insert("request_digest".to_string(), Value::String(digest.to_string()));
        merged.insert("host".to_string(), Value::String(host.clone()));
        Self { host, merged }
    }

    /// Offers one stdout line. Returns `true` when the line was a single
    /// JSON object and has been merged; `false` lines belong in the output
    /// log verbatim.
    pub fn ingest_line(&mut self, line: &str) -> bool {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return false;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(object)) => {
                for (key, value) in object {
                    self.merged.insert(key, value);
                }
                true
            }
            _ => false,
        }
    }

    /// Records the run's terminal error as a kv-formatted chain.
    pub fn record_error(&mut self, error: &RunnerError) {
        self.merged.insert(
            "error".to_string(),
            Value::String(format!("kind=\"{:?}\" msg=\"{}\"", kind_of(error), error)),
        );
    }

    /// Records the run's exit status.
    pub fn record_status(&mut self, ok: bool, exit_code: Option<i32>) {
        self.merged.insert("ok".to_string(), Value::Bool(ok));
        if let Some(code) = exit_code {
            self.merged
                .insert("exit_code".to_string(), Value::from(code));
        }
    }

    /// Writes `scrape-<host>-<base62-ts>.json` under `dir` and returns the
    /// path. Best-effort callers ignore the result on teardown paths.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, RunnerError> {
        std::fs::create_dir_all(dir)?;
        let stamp = base62_encode(next_scrape_stamp());
        let path = dir.join(format!("scrape-{}-{}.json", self.host, stamp));
        let body = serde_json::to_string_pretty(&Value::Object(self.merged.clone()))?;
        std::fs::write(&path, body)?;
        Ok(path)
    }

    /// The merged document, for tests and final reporting.
    pub fn document(&self) -> &Map<String, Value> {
        &self.merged
    }
}

fn kind_of(error: &RunnerError) -> &'static str {
    match error {
        RunnerError::InvalidRequest(_) => "InvalidRequest",
        RunnerError::BadScheme(_) => "BadScheme",
        RunnerError::InsufficientCapacity { .. } => "InsufficientCapacity",
        RunnerError::InvalidLimits(_) => "InvalidLimits",
        RunnerError::UnknownDevice(_) => "UnknownDevice",
        RunnerError::NotFound(_) => "NotFound",
        RunnerError::Auth(_) => "Auth",
        RunnerError::Network(_) => "Network",
        RunnerError::BadArchive(_) => "BadArchive",
        RunnerError::CorruptArchive(_) => "CorruptArchive",
        RunnerError::Staging(_) => "Staging",
        RunnerError::Execution(_) => "Execution",
        RunnerError::QueueError(_) => "Queue",
        RunnerError::TimeoutError(_) => "Timeout",
        RunnerError::Cancelled(_) => "Cancelled",
        RunnerError::IoError(_) => "Io",
        RunnerError::SerializationError(_) => "Serialization",
        RunnerError::InvalidConfiguration(_) => "InvalidConfiguration",
        RunnerError::MetricsError(_) => "Metrics",
        RunnerError::InternalError(_) => "Internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base62_alphabet_edges() {
        assert_eq!(base62_encode(0), "0");
        assert_eq!(base62_encode(9), "9");
        assert_eq!(base62_encode(10), "A");
        assert_eq!(base62_encode(61), "z");
        assert_eq!(base62_encode(62), "10");
        assert_eq!(base62_encode(62 * 62), "100");
    }

    #[test]
    fn test_stamps_strictly_increase() {
        let a = next_scrape_stamp();
        let b = next_scrape_stamp();
        let c = next_scrape_stamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_json_lines_merge_and_others_pass() {
        let mut doc = ScrapeDocument::new("host-1", "exp-123", "digest");
        assert!(doc.ingest_line(r#"{"loss": 0.5, "epoch": 1}"#));
        assert!(doc.ingest_line(r#"{"loss": 0.25, "epoch": 2}"#));
        assert!(!doc.ingest_line("epoch 3 starting"));
        assert!(!doc.ingest_line("[1, 2, 3]"));
        assert!(!doc.ingest_line("{not json"));

        let merged = doc.document();
        assert_eq!(merged["loss"], Value::from(0.25));
        assert_eq!(merged["epoch"], Value::from(2));
        assert_eq!(merged["experiment"], Value::from("exp-123"));
    }

    #[test]
    fn test_scrape_file_naming_and_error_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = ScrapeDocument::new("worker-a", "exp-9", "d1gest");
        doc.record_error(&RunnerError::BadArchive("escape attempt".into()));
        doc.record_status(false, Some(1));

        let path = doc.write(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("scrape-worker-a-"));
        assert!(name.ends_with(".json"));

        let body: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(body["ok"], Value::Bool(false));
        assert_eq!(body["host"], Value::from("worker-a"));
        let error = body["error"].as_str().unwrap();
        assert!(error.contains("kind=\"BadArchive\""));
        assert!(error.contains("escape attempt"));
    }
}
