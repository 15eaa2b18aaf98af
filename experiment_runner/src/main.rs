// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Experiment Runner Entry Point
//!
//! Wires the process together: CLI and configuration, logging, the
//! process-wide singletons (ledger, cache, metrics), signal handling, the
//! lifecycle watcher, the cache groomer, and one dispatch loop per
//! configured queue backend. The singletons are initialized before any
//! loop starts and torn down only after every loop has drained.

use std::sync::Arc;

use anyhow::Context;
use experiment_runner::application::dispatch::{DispatchLoop, Dispatcher};
use experiment_runner::infrastructure::cache::groomer::spawn_groomer;
use experiment_runner::infrastructure::cache::ArtifactCache;
use experiment_runner::infrastructure::config::RunnerConfig;
use experiment_runner::infrastructure::ledger::ResourceLedger;
use experiment_runner::infrastructure::lifecycle::spawn_lifecycle_watcher;
use experiment_runner::infrastructure::logging::init_logging;
use experiment_runner::infrastructure::metrics::MetricsService;
use experiment_runner::infrastructure::queue::build_backends;
use experiment_runner_bootstrap::cli::parse_and_validate;
use experiment_runner_bootstrap::platform::create_platform;
use experiment_runner_bootstrap::shutdown::{DrainCoordinator, DrainKind};
use experiment_runner_bootstrap::signals::install_drain_signals;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_and_validate().context("invalid command line")?;
    init_logging(cli.verbose);

    let config = RunnerConfig::load(&cli).context("loading configuration")?;
    std::fs::create_dir_all(&config.scratch_dir)
        .with_context(|| format!("creating scratch root {:?}", config.scratch_dir))?;

    let platform: Arc<dyn experiment_runner_bootstrap::platform::Platform> =
        Arc::from(create_platform());
    let host = platform.hostname();
    tracing::info!(
        host = %host,
        platform = platform.platform_name(),
        cpus = platform.cpu_count(),
        "experiment runner starting"
    );

    // Process-wide singletons: built before the loops, torn down after.
    let metrics = MetricsService::new().context("metrics registry")?;
    let ledger = Arc::new(
        ResourceLedger::new(&config, platform.clone()).context("resource ledger")?,
    );
    for card in ledger.describe_gpus() {
        tracing::info!(
            uuid = %card.uuid,
            slots = card.total_slots,
            mem = card.total_mem,
            "gpu card registered"
        );
    }
    let cache = Arc::new(ArtifactCache::new(&config.cache, metrics.clone()).context("artifact cache")?);

    let coordinator = DrainCoordinator::default();
    install_drain_signals(coordinator.clone());

    let background_cancel = coordinator.token().child_token();
    let groomer = spawn_groomer(
        cache.clone(),
        config.cache.groom_interval,
        background_cancel.clone(),
    );
    let watcher = spawn_lifecycle_watcher(
        config.lifecycle.clone(),
        coordinator.clone(),
        background_cancel.clone(),
    );

    let backends = build_backends(&config).await.context("queue backends")?;
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        ledger,
        cache,
        metrics,
        coordinator.clone(),
        host,
    ));

    // One loop per backend credential set; independent queue families do
    // not block each other.
    let mut loops = Vec::new();
    for (label, backend) in backends {
        let dispatch_loop = DispatchLoop::new(label.clone(), backend, dispatcher.clone())
            .context("dispatch loop")?;
        loops.push(tokio::spawn(async move {
            if let Err(error) = dispatch_loop.run().await {
                tracing::error!(backend = %label, error = %error, "dispatch loop failed");
            }
        }));
    }

    for task in loops {
        let _ = task.await;
    }

    // A loop exiting on its caps means the process should be replaced;
    // drain whatever the other loops left in flight.
    coordinator.request_drain(DrainKind::Terminate);
    let drained = coordinator.wait_idle().await;
    if !drained {
        tracing::warn!("in-flight work cancelled at the drain grace boundary");
    }

    background_cancel.cancel();
    let _ = watcher.await;
    let _ = groomer.await;

    tracing::info!(tasks = dispatcher.tasks_done(), "experiment runner stopped");
    Ok(())
}
