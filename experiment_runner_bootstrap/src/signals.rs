// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # System Signal Handling
//!
//! Maps OS signals onto drain requests:
//!
//! - **SIGTERM / SIGINT** - drain and terminate (pod replacement, Ctrl+C)
//! - **SIGUSR2** - drain and suspend (operator pause, Unix only)
//!
//! The file-based lifecycle source is handled elsewhere; signals and the
//! polled file feed the same [`DrainCoordinator`].

use crate::shutdown::{DrainCoordinator, DrainKind};

/// Spawns the signal listener task. Signals keep being serviced for the
/// life of the process; each one is translated into a drain request on the
/// coordinator.
pub fn install_drain_signals(coordinator: DrainCoordinator) {
    tokio::spawn(async move {
        listen(coordinator).await;
    });
}

#[cfg(unix)]
async fn listen(coordinator: DrainCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGINT handler");
            return;
        }
    };
    let mut sigusr2 = match signal(SignalKind::user_defined2()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGUSR2 handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, draining to terminate");
                coordinator.request_drain(DrainKind::Terminate);
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, draining to terminate");
                coordinator.request_drain(DrainKind::Terminate);
            }
            _ = sigusr2.recv() => {
                tracing::info!("received SIGUSR2, draining to suspend");
                coordinator.request_drain(DrainKind::Suspend);
            }
        }
    }
}

#[cfg(windows)]
async fn listen(coordinator: DrainCoordinator) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to listen for ctrl-c");
            return;
        }
        tracing::info!("received ctrl-c, draining to terminate");
        coordinator.request_drain(DrainKind::Terminate);
    }
}
