// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Lifecycle State Source
//!
//! The operator maintains a key/value out-of-band; here it is a small file
//! containing one of `Running | DrainAndTerminate | DrainAndSuspend`. The
//! watcher polls it and feeds transitions into the drain coordinator; OS
//! signals feed the same coordinator, so the dispatch loop has a single
//! place to ask.
//!
//! Unknown file content is treated as `Running` with a warning rather than
//! draining a fleet on a typo.

use std::str::FromStr;

use experiment_runner_bootstrap::shutdown::{DrainCoordinator, DrainKind};
use experiment_runner_domain::LifecycleState;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::LifecycleConfig;

/// The lifecycle state the coordinator currently reflects.
pub fn lifecycle_state(coordinator: &DrainCoordinator) -> LifecycleState {
    match coordinator.drain_kind() {
        None => LifecycleState::Running,
        Some(DrainKind::Terminate) => LifecycleState::DrainAndTerminate,
        Some(DrainKind::Suspend) => LifecycleState::DrainAndSuspend,
    }
}

/// Applies one observed state to the coordinator.
fn apply(state: LifecycleState, coordinator: &DrainCoordinator) {
    match state {
        LifecycleState::Running => coordinator.resume(),
        LifecycleState::DrainAndTerminate => coordinator.request_drain(DrainKind::Terminate),
        LifecycleState::DrainAndSuspend => coordinator.request_drain(DrainKind::Suspend),
    }
}

/// Spawns the polling watcher. Resolves when the token cancels. With no
/// file configured the watcher is inert and signals remain the only
/// lifecycle source.
pub fn spawn_lifecycle_watcher(
    config: LifecycleConfig,
    coordinator: DrainCoordinator,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = match config.file {
            Some(path) => path,
            None => return,
        };
        let mut ticker = tokio::time::interval(config.poll_interval);
        let mut last_warned = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let text = match tokio::fs::read_to_string(&path).await {
                        Ok(text) => text,
                        // Absent file means the operator has not weighed in.
                        Err(_) => continue,
                    };
                    match LifecycleState::from_str(&text) {
                        Ok(state) => {
                            last_warned.clear();
                            apply(state, &coordinator);
                        }
                        Err(_) => {
                            let trimmed = text.trim().to_string();
                            if trimmed != last_warned {
                                tracing::warn!(
                                    content = %trimmed,
                                    "lifecycle file holds no known state, assuming Running"
                                );
                                last_warned = trimmed;
                            }
                            apply(LifecycleState::Running, &coordinator);
                        }
                    }
                }
            }
        }
    })
}
