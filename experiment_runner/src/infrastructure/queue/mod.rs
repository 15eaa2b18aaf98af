// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Queue Adapter
//!
//! One [`QueueService`] implementation per backend: AMQP (RabbitMQ) and
//! SQS. The closed variant set mirrors the storage adapter; new backends
//! are added at compile time. The operator's queue-name regex is applied
//! uniformly during discovery in both backends.

pub mod amqp;
pub mod sqs;

use std::sync::Arc;

use experiment_runner_domain::{QueueService, RunnerError};

use crate::infrastructure::config::RunnerConfig;

pub use amqp::AmqpQueue;
pub use sqs::SqsQueue;

/// Builds every backend the configuration names, labelled for logging.
pub async fn build_backends(
    config: &RunnerConfig,
) -> Result<Vec<(String, Arc<dyn QueueService>)>, RunnerError> {
    let mut backends: Vec<(String, Arc<dyn QueueService>)> = Vec::new();
    if let Some(amqp) = &config.amqp {
        backends.push((
            "amqp".to_string(),
            Arc::new(AmqpQueue::new(amqp.clone(), config.tls.clone())?),
        ));
    }
    if let Some(sqs) = &config.sqs {
        backends.push(("sqs".to_string(), Arc::new(SqsQueue::new(sqs).await?)));
    }
    if backends.is_empty() {
        return Err(RunnerError::invalid_config(
            "no queue backend configured; set [amqp] or [sqs]",
        ));
    }
    Ok(backends)
}
