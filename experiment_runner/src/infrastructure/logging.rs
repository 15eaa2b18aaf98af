// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Logging Setup
//!
//! Structured logging via `tracing`. The subscriber writes human-readable
//! lines to stderr so experiment stdout capture is never polluted; levels
//! come from `RUST_LOG` with a verbosity flag fallback.
//!
//! Error sites across the runner attach a short `stack=` context chain for
//! post-mortem grepping, per the error-handling contract.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. Call once, before any spans open.
pub fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
