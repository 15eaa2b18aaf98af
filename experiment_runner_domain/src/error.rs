// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! A single hierarchical error enum for the experiment runner. Errors are
//! returned as values across every layer boundary; nothing in the runner
//! signals failure by panicking, because a worker that dies mid-lease leaves
//! a message invisible until its visibility window lapses.
//!
//! ## Error Categories
//!
//! - **Bad-request**: `InvalidRequest`, `BadScheme`, `BadArchive`,
//!   `SerializationError` - the message itself is unusable; the dispatcher
//!   acks it with a failure scrape so the poison pill does not recycle.
//!   `BadArchive` is reserved for archive members that escape the
//!   extraction root; no redelivery can ever make one safe
//! - **Capacity**: `InsufficientCapacity` - the host cannot satisfy the
//!   request right now; the message is nacked for another worker
//! - **Transient**: `Network`, `QueueError`, `TimeoutError`, `IoError` -
//!   retried after backoff, message stays on the queue
//! - **Terminal for this run**: `Staging`, `CorruptArchive`, `Execution`,
//!   `Cancelled` - surfaced into the run's scrape metadata. A corrupt
//!   archive (truncated object, flaky download) is a staging fault: the
//!   message is nacked with an attempt marker and only demoted to
//!   bad-request once the configured attempt count is exhausted
//! - **Process-fatal**: `InternalError` on infrastructure corruption; the
//!   operator replaces the worker
//!
//! The classification predicates (`is_recoverable`, `is_bad_request`) encode
//! the retry policy in one place so the dispatch loop and the executor agree
//! on it.

use thiserror::Error;

/// Resource dimensions reported by the ledger when an allocation cannot be
/// satisfied. Carried inside [`RunnerError::InsufficientCapacity`] so the
/// dispatcher can expose per-dimension rejection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Cpu,
    Ram,
    Disk,
    GpuSlots,
    GpuMem,
}

impl std::fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceDimension::Cpu => "cpu",
            ResourceDimension::Ram => "ram",
            ResourceDimension::Disk => "disk",
            ResourceDimension::GpuSlots => "gpu_slots",
            ResourceDimension::GpuMem => "gpu_mem",
        };
        write!(f, "{}", name)
    }
}

/// Domain-specific errors for the experiment runner.
///
/// Each variant carries a descriptive message. Variants map onto the failure
/// kinds of the dispatch contract: bad requests are acked away, capacity
/// misses are nacked for redelivery, transient faults are retried.
#[derive(Error, Debug, Clone)]
pub enum RunnerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported storage scheme: {0}")]
    BadScheme(String),

    #[error("Insufficient capacity ({dimension}): {detail}")]
    InsufficientCapacity {
        dimension: ResourceDimension,
        detail: String,
    },

    #[error("Invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    /// An archive member tried to escape the extraction root. Never
    /// retried; redelivery cannot make the archive safe.
    #[error("Bad archive: {0}")]
    BadArchive(String),

    /// The archive is unreadable (truncated, bad magic, failed entry).
    /// Retried through the staging path; a re-download may succeed.
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RunnerError {
    /// Creates a new invalid-request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Creates a new capacity error for the given dimension
    pub fn insufficient(dimension: ResourceDimension, detail: impl Into<String>) -> Self {
        Self::InsufficientCapacity {
            dimension,
            detail: detail.into(),
        }
    }

    /// Creates a new staging error
    pub fn staging(msg: impl Into<String>) -> Self {
        Self::Staging(msg.into())
    }

    /// Creates a new execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Creates a new queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::QueueError(msg.into())
    }

    /// Creates a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Creates a new IO error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::IoError(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::TimeoutError(msg.into())
    }

    /// Creates a new configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Checks if the error indicates a transient condition worth retrying.
    ///
    /// Recoverable errors leave the message on the queue; the dispatcher
    /// backs off and lets the lease lapse or nacks explicitly.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RunnerError::Network(_)
                | RunnerError::QueueError(_)
                | RunnerError::TimeoutError(_)
                | RunnerError::IoError(_)
        )
    }

    /// Checks if the error condemns the message itself rather than the host.
    ///
    /// Bad-request errors are acked with a failure scrape: redelivering a
    /// message that can never parse or stage only poisons the next worker.
    /// `CorruptArchive` is deliberately absent; a fresh download may read
    /// fine, so it rides the staging retry path instead.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            RunnerError::InvalidRequest(_)
                | RunnerError::BadScheme(_)
                | RunnerError::BadArchive(_)
                | RunnerError::SerializationError(_)
        )
    }

    /// Checks if the error reports a capacity mismatch
    pub fn is_capacity(&self) -> bool {
        matches!(self, RunnerError::InsufficientCapacity { .. })
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self {
        RunnerError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_dimension() {
        let err = RunnerError::insufficient(ResourceDimension::GpuMem, "need 32gb, have 16gb");
        assert_eq!(
            err.to_string(),
            "Insufficient capacity (gpu_mem): need 32gb, have 16gb"
        );
    }

    #[test]
    fn test_classification_predicates() {
        assert!(RunnerError::network("conn reset").is_recoverable());
        assert!(RunnerError::timeout("fetch").is_recoverable());
        assert!(!RunnerError::invalid_request("no key").is_recoverable());

        assert!(RunnerError::BadArchive("escape".into()).is_bad_request());
        assert!(RunnerError::BadScheme("ftp".into()).is_bad_request());
        assert!(!RunnerError::CorruptArchive("truncated".into()).is_bad_request());
        assert!(!RunnerError::network("conn reset").is_bad_request());

        assert!(RunnerError::insufficient(ResourceDimension::Cpu, "busy").is_capacity());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RunnerError = io.into();
        assert!(matches!(err, RunnerError::IoError(_)));
    }
}
