// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Experiment Runner
//!
//! A self-directed worker process for distributed ML experiments. Each
//! worker polls one or more message-queue backends, matches requests
//! against local hardware, stages inputs through a content-addressed
//! artifact cache, executes the experiment in an isolated interpreter
//! environment, streams results back to object storage, and settles the
//! queue message according to outcome.
//!
//! ## Architecture
//!
//! The crate follows the domain / application / infrastructure layering of
//! the workspace:
//!
//! - **Application**: the dispatch loop (top-level scheduler) and the
//!   experiment executor (per-request environment builder and process
//!   supervisor)
//! - **Infrastructure**: the resource ledger, artifact cache, storage
//!   backends, queue backends, configuration, metrics, and logging
//!
//! Data flow: the dispatcher polls a queue adapter; on a message it
//! unmarshals the request, dry-runs an allocation against the ledger, and
//! only settles the lease once real capacity is held. The executor stages
//! artifacts through the cache (which drives the storage adapter), runs
//! the child process, periodically re-uploads changed mutable artifacts,
//! and releases everything on exit.
//!
//! ## Process-wide state
//!
//! The ledger and the cache are process singletons: initialized before the
//! dispatch loop starts, torn down only at clean exit. Everything else is
//! per-request.

pub mod application;
pub mod infrastructure;

pub use application::dispatch::{DispatchLoop, Dispatcher};
pub use application::executor::ExperimentExecutor;
pub use infrastructure::cache::ArtifactCache;
pub use infrastructure::config::RunnerConfig;
pub use infrastructure::ledger::ResourceLedger;
pub use infrastructure::metrics::MetricsService;
