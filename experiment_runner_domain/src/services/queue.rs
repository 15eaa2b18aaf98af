// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Queue Port
//!
//! The uniform poll/ack/nack contract over message-queue backends.
//!
//! ## `work` semantics
//!
//! `work` pulls at most one message and hands its body to the
//! [`TaskHandler`]. The handler's verdict drives the settlement:
//!
//! - ack is sent only when the handler returned `ack=true` AND no
//!   unrecoverable error occurred during handling
//! - otherwise the message is nacked back for redelivery
//! - cancellation of the passed token promptly nacks and returns
//!
//! Backends with lease-based visibility (SQS) re-assert the lease at half
//! the visibility period while the handler runs, so a slow experiment is
//! not double-dispatched.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::value_objects::resource::Resource;

/// Outcome the handler reports for one message.
#[derive(Debug, Clone, Default)]
pub struct HandlerVerdict {
    /// Resource claim the message represented, when it parsed far enough to
    /// know. Persisted as the queue's sizing hint for pre-lease dry-runs.
    pub resource: Option<Resource>,

    /// True to settle the message as done; false to return it for
    /// redelivery.
    pub ack: bool,
}

impl HandlerVerdict {
    /// Settle the message, recording the resource it claimed.
    pub fn ack(resource: Resource) -> Self {
        Self {
            resource: Some(resource),
            ack: true,
        }
    }

    /// Return the message for another worker.
    pub fn nack() -> Self {
        Self {
            resource: None,
            ack: false,
        }
    }
}

/// Message-body processor supplied by the dispatch loop.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handles one message body. The token cancels in-flight work when the
    /// lease must be abandoned.
    async fn handle(&self, cancel: CancellationToken, queue: &str, body: &[u8]) -> HandlerVerdict;
}

/// Result of one `work` call.
#[derive(Debug, Clone, Default)]
pub struct WorkOutcome {
    /// Messages handled (0 when the poll returned empty)
    pub handled: usize,

    /// Resource hint carried back from the handler verdict
    pub resource: Option<Resource>,
}

/// Uniform queue access: one implementation per backend.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Lists queue identifiers visible to this backend whose names match
    /// `filter`.
    async fn discover(&self, filter: &Regex, timeout: Duration) -> Result<Vec<String>, RunnerError>;

    /// True when the named queue still exists on the backend.
    async fn exists(&self, name: &str) -> Result<bool, RunnerError>;

    /// Pulls at most one message from `name`, runs the handler, settles the
    /// message per the verdict.
    async fn work(
        &self,
        cancel: CancellationToken,
        lease: Duration,
        name: &str,
        handler: &dyn TaskHandler,
    ) -> Result<WorkOutcome, RunnerError>;
}

/// Decides the settlement for a handled message.
///
/// Kept as a free function so the ack-on-success-only property is testable
/// without a live backend: ack exactly when the handler said so and the
/// handling error, if any, was recoverable enough to have produced a real
/// verdict.
pub fn should_ack(verdict: &HandlerVerdict, handling_error: Option<&RunnerError>) -> bool {
    verdict.ack && handling_error.is_none()
}
