// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Metrics Service
//!
//! Prometheus registry for the worker. The registry is exposed to whatever
//! embeds the process; no network listener lives here. Counters cover the
//! contract points other components report against: cache effectiveness,
//! task settlement, and per-dimension allocation rejections.

use std::sync::Arc;

use experiment_runner_domain::{ResourceDimension, RunnerError};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Shared handle to the worker's metric families.
#[derive(Clone)]
pub struct MetricsService {
    registry: Arc<Registry>,

    // Cache effectiveness
    cache_hits_total: IntCounter,
    cache_misses_total: IntCounter,
    cache_evictions_total: IntCounter,

    // Task settlement
    tasks_total: IntCounterVec,
    tasks_in_flight: IntGauge,
    queue_acks_total: IntCounter,
    queue_nacks_total: IntCounter,

    // Scheduling
    alloc_failures_total: IntCounterVec,
}

impl MetricsService {
    /// Creates the registry and registers every family under the `runner`
    /// namespace.
    pub fn new() -> Result<Self, RunnerError> {
        let registry = Registry::new();

        let cache_hits_total = IntCounter::with_opts(
            Opts::new("cache_hits_total", "Artifact cache hits").namespace("runner"),
        )
        .map_err(|e| RunnerError::MetricsError(e.to_string()))?;

        let cache_misses_total = IntCounter::with_opts(
            Opts::new("cache_misses_total", "Artifact cache misses").namespace("runner"),
        )
        .map_err(|e| RunnerError::MetricsError(e.to_string()))?;

        let cache_evictions_total = IntCounter::with_opts(
            Opts::new("cache_evictions_total", "Artifact cache evictions").namespace("runner"),
        )
        .map_err(|e| RunnerError::MetricsError(e.to_string()))?;

        let tasks_total = IntCounterVec::new(
            Opts::new("tasks_total", "Completed tasks by outcome").namespace("runner"),
            &["outcome"],
        )
        .map_err(|e| RunnerError::MetricsError(e.to_string()))?;

        let tasks_in_flight = IntGauge::with_opts(
            Opts::new("tasks_in_flight", "Experiments currently executing").namespace("runner"),
        )
        .map_err(|e| RunnerError::MetricsError(e.to_string()))?;

        let queue_acks_total = IntCounter::with_opts(
            Opts::new("queue_acks_total", "Messages settled as done").namespace("runner"),
        )
        .map_err(|e| RunnerError::MetricsError(e.to_string()))?;

        let queue_nacks_total = IntCounter::with_opts(
            Opts::new("queue_nacks_total", "Messages returned for redelivery").namespace("runner"),
        )
        .map_err(|e| RunnerError::MetricsError(e.to_string()))?;

        let alloc_failures_total = IntCounterVec::new(
            Opts::new("alloc_failures_total", "Allocation rejections by dimension")
                .namespace("runner"),
            &["dimension"],
        )
        .map_err(|e| RunnerError::MetricsError(e.to_string()))?;

        for collector in [
            Box::new(cache_hits_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cache_misses_total.clone()),
            Box::new(cache_evictions_total.clone()),
            Box::new(tasks_total.clone()),
            Box::new(tasks_in_flight.clone()),
            Box::new(queue_acks_total.clone()),
            Box::new(queue_nacks_total.clone()),
            Box::new(alloc_failures_total.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| RunnerError::MetricsError(e.to_string()))?;
        }

        Ok(Self {
            registry: Arc::new(registry),
            cache_hits_total,
            cache_misses_total,
            cache_evictions_total,
            tasks_total,
            tasks_in_flight,
            queue_acks_total,
            queue_nacks_total,
            alloc_failures_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    pub fn record_cache_eviction(&self) {
        self.cache_evictions_total.inc();
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits_total.get()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses_total.get()
    }

    pub fn task_started(&self) {
        self.tasks_in_flight.inc();
    }

    /// Settles the in-flight gauge and counts the outcome. Pair with
    /// [`task_started`](Self::task_started).
    pub fn task_finished(&self, outcome: &str) {
        self.tasks_in_flight.dec();
        self.record_outcome(outcome);
    }

    /// Counts an outcome for a message that never became an in-flight task
    /// (poison pills, unfit requests).
    pub fn record_outcome(&self, outcome: &str) {
        self.tasks_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_ack(&self) {
        self.queue_acks_total.inc();
    }

    pub fn record_nack(&self) {
        self.queue_nacks_total.inc();
    }

    pub fn record_alloc_failure(&self, dimension: ResourceDimension) {
        self.alloc_failures_total
            .with_label_values(&[&dimension.to_string()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsService::new().unwrap();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        assert_eq!(metrics.cache_hits(), 2);
        assert_eq!(metrics.cache_misses(), 1);
    }

    #[test]
    fn test_task_gauge_balances() {
        let metrics = MetricsService::new().unwrap();
        metrics.task_started();
        metrics.task_started();
        metrics.task_finished("ok");
        metrics.task_finished("failed");
        let families = metrics.registry().gather();
        let gauge = families
            .iter()
            .find(|f| f.name() == "runner_tasks_in_flight")
            .unwrap();
        assert_eq!(gauge.get_metric()[0].get_gauge().value(), 0.0);
    }

    #[test]
    fn test_alloc_failure_dimensions_labelled() {
        let metrics = MetricsService::new().unwrap();
        metrics.record_alloc_failure(ResourceDimension::GpuMem);
        let families = metrics.registry().gather();
        let family = families
            .iter()
            .find(|f| f.name() == "runner_alloc_failures_total")
            .unwrap();
        let label = &family.get_metric()[0].get_label()[0];
        assert_eq!(label.name(), "dimension");
        assert_eq!(label.value(), "gpu_mem");
    }
}
