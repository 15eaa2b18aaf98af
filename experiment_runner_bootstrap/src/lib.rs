// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Experiment Runner Bootstrap
//!
//! Process-edge concerns that sit outside the application layers: CLI
//! parsing with a validation pass, OS signal handling, drain coordination,
//! and the platform abstraction for host inspection (memory, disk, CPUs).
//!
//! ## Why a separate crate
//!
//! The bootstrap layer may touch platform APIs directly (`libc`, `winapi`)
//! and owns the only `process::exit` call sites. Keeping it apart from the
//! domain and application crates keeps those layers testable without a
//! terminal or a signal handler in sight.
//!
//! ## Modules
//!
//! - `cli` - clap definition and the validated form handed to the app
//! - `signals` - SIGINT/SIGTERM/SIGUSR2 mapped onto drain requests
//! - `shutdown` - the drain coordinator: stop pickup, wait for in-flight
//!   work, enforce a grace period
//! - `platform` - host inspection behind a trait, Unix and Windows impls

pub mod cli;
pub mod platform;
pub mod shutdown;
pub mod signals;

pub use cli::{parse_and_validate, Cli, ParseError, ValidatedCli};
pub use platform::{create_platform, Platform, PlatformError};
pub use shutdown::{DrainCoordinator, DrainKind, TaskGuard};
pub use signals::install_drain_signals;
