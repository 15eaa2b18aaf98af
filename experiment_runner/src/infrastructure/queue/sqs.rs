// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # SQS Queue Backend
//!
//! SQS access through the AWS SDK. Discovery lists the region's queues and
//! filters by the operator's name regex; identifiers are full queue URLs.
//!
//! ## Visibility extension
//!
//! A leased message is invisible only for the visibility window. While the
//! handler runs, a concurrent ticker re-asserts the lease at half the
//! window so a slow experiment is never double-dispatched. The ticker
//! stops the moment the handler returns; an explicit zero-visibility
//! change releases nacked messages immediately instead of letting the
//! window lapse.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::config::Region;
use experiment_runner_domain::{
    services::queue::should_ack, QueueService, RunnerError, TaskHandler, WorkOutcome,
};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::SqsConfig;

/// SQS-backed queue service.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
}

impl SqsQueue {
    /// Builds the client from the process credential chain; queue access
    /// is a worker-level concern, unlike storage credentials which travel
    /// per request.
    pub async fn new(config: &SqsConfig) -> Result<Self, RunnerError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        Ok(Self {
            client: aws_sdk_sqs::Client::new(&sdk_config),
        })
    }

    fn queue_name(url: &str) -> &str {
        url.rsplit('/').next().unwrap_or(url)
    }
}

fn map_sdk_err<E: std::fmt::Display, R: std::fmt::Debug>(
    err: aws_sdk_sqs::error::SdkError<E, R>,
) -> RunnerError {
    RunnerError::queue(format!("sqs: {}", err))
}

#[async_trait]
impl QueueService for SqsQueue {
    async fn discover(
        &self,
        filter: &Regex,
        timeout: Duration,
    ) -> Result<Vec<String>, RunnerError> {
        let listing = tokio::time::timeout(timeout, self.client.list_queues().send())
            .await
            .map_err(|_| RunnerError::timeout("sqs list_queues"))?
            .map_err(map_sdk_err)?;

        let mut queues: Vec<String> = listing
            .queue_urls()
            .iter()
            .filter(|url| filter.is_match(Self::queue_name(url)))
            .cloned()
            .collect();
        queues.sort();
        Ok(queues)
    }

    async fn exists(&self, name: &str) -> Result<bool, RunnerError> {
        let result = self
            .client
            .get_queue_url()
            .queue_name(Self::queue_name(name))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_queue_does_not_exist() {
                    Ok(false)
                } else {
                    Err(RunnerError::queue(format!("sqs get_queue_url: {}", service_err)))
                }
            }
        }
    }

    async fn work(
        &self,
        cancel: CancellationToken,
        lease: Duration,
        name: &str,
        handler: &dyn TaskHandler,
    ) -> Result<WorkOutcome, RunnerError> {
        let visibility = lease.as_secs().clamp(1, 43_200) as i32;
        let received = self
            .client
            .receive_message()
            .queue_url(name)
            .max_number_of_messages(1)
            .wait_time_seconds(5)
            .visibility_timeout(visibility)
            .send()
            .await
            .map_err(map_sdk_err)?;

        let message = match received.messages().first() {
            Some(message) => message.clone(),
            None => return Ok(WorkOutcome::default()),
        };
        let receipt = match message.receipt_handle() {
            Some(receipt) => receipt.to_string(),
            None => return Ok(WorkOutcome::default()),
        };
        let body = message.body().unwrap_or_default().as_bytes().to_vec();

        // Lease extender: re-assert visibility at half the window until
        // the handler settles.
        let extender_client = self.client.clone();
        let extender_queue = name.to_string();
        let extender_receipt = receipt.clone();
        let extender_stop = CancellationToken::new();
        let extender_guard = extender_stop.clone();
        let extender = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs((visibility as u64 / 2).max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = extender_guard.cancelled() => return,
                    _ = ticker.tick() => {
                        let result = extender_client
                            .change_message_visibility()
                            .queue_url(&extender_queue)
                            .receipt_handle(&extender_receipt)
                            .visibility_timeout(visibility)
                            .send()
                            .await;
                        if let Err(err) = result {
                            tracing::warn!(error = %err, "visibility extension failed");
                        }
                    }
                }
            }
        });

        // The handler owns the cancel token and returns promptly once it
        // fires; racing it here would drop a live run with resources still
        // held.
        let verdict = handler.handle(cancel.child_token(), name, &body).await;
        extender_stop.cancel();
        let _ = extender.await;
        if should_ack(&verdict, None) {
            self.client
                .delete_message()
                .queue_url(name)
                .receipt_handle(&receipt)
                .send()
                .await
                .map_err(map_sdk_err)?;
        } else {
            // Release immediately rather than letting the window lapse.
            let result = self
                .client
                .change_message_visibility()
                .queue_url(name)
                .receipt_handle(&receipt)
                .visibility_timeout(0)
                .send()
                .await;
            if let Err(err) = result {
                tracing::warn!(error = %err, "nack visibility reset failed");
            }
        }

        Ok(WorkOutcome {
            handled: 1,
            resource: verdict.resource,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_from_url() {
        assert_eq!(
            SqsQueue::queue_name("https://sqs.us-west-2.amazonaws.com/123456789/sqs_train"),
            "sqs_train"
        );
        assert_eq!(SqsQueue::queue_name("sqs_train"), "sqs_train");
    }
}
