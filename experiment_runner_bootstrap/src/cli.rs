// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Command-Line Interface Module
//!
//! Bootstrap-layer CLI handling: parse with clap, then validate every value
//! before it reaches the application. Flags override the configuration
//! file; the precedence (flag > env > file > default) is resolved by the
//! application's config loader, which receives the validated form produced
//! here.
//!
//! ```text
//! parse_cli()  ->  validate()  ->  ValidatedCli
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

/// CLI validation errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Bad queue filter regex: {0}")]
    BadRegex(String),

    #[error("Bad byte quantity for {flag}: {detail}")]
    BadBytes { flag: &'static str, detail: String },

    #[error("Bad duration for {flag}: {detail}")]
    BadDuration { flag: &'static str, detail: String },

    #[error("Value out of range for {flag}: {detail}")]
    OutOfRange { flag: &'static str, detail: String },
}

/// Experiment runner - pulls ML experiment requests off message queues and
/// executes them against local hardware.
#[derive(Debug, Parser)]
#[command(name = "experiment_runner", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Artifact cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Artifact cache byte cap, e.g. "10gb"
    #[arg(long)]
    pub cache_size: Option<String>,

    /// Scratch root for per-run working directories
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Regular expression selecting which discovered queues to serve
    #[arg(long)]
    pub queue_match: Option<String>,

    /// AMQP broker URI (amqp:// or amqps://)
    #[arg(long)]
    pub amqp_url: Option<String>,

    /// AWS region for SQS discovery
    #[arg(long)]
    pub sqs_region: Option<String>,

    /// Exit after this many completed tasks (0 = unlimited)
    #[arg(long)]
    pub max_tasks: Option<usize>,

    /// Exit after this long without leasing any work, e.g. "15m"
    #[arg(long)]
    pub idle_timeout: Option<String>,

    /// Mutable-artifact rescan interval, e.g. "30s"
    #[arg(long)]
    pub refresh_interval: Option<String>,

    /// Path to the operator-maintained lifecycle state file
    #[arg(long)]
    pub lifecycle_file: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(short, long)]
    pub verbose: bool,
}

/// CLI values after validation; byte and duration strings are parsed,
/// the regex is known to compile.
#[derive(Debug, Clone, Default)]
pub struct ValidatedCli {
    pub config: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub cache_size: Option<u64>,
    pub scratch_dir: Option<PathBuf>,
    pub queue_match: Option<String>,
    pub amqp_url: Option<String>,
    pub sqs_region: Option<String>,
    pub max_tasks: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub refresh_interval: Option<Duration>,
    pub lifecycle_file: Option<PathBuf>,
    pub verbose: bool,
}

/// Parses argv. Split from validation so tests can feed raw `Cli` values.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Validates a parsed CLI into the form handed to the application.
pub fn validate(cli: Cli) -> Result<ValidatedCli, ParseError> {
    let queue_match = match cli.queue_match {
        Some(pattern) => {
            regex::Regex::new(&pattern).map_err(|e| ParseError::BadRegex(e.to_string()))?;
            Some(pattern)
        }
        None => None,
    };

    let cache_size = cli
        .cache_size
        .map(|text| parse_bytes_flag("--cache-size", &text))
        .transpose()?;

    let idle_timeout = cli
        .idle_timeout
        .map(|text| parse_duration_flag("--idle-timeout", &text))
        .transpose()?;

    let refresh_interval = cli
        .refresh_interval
        .map(|text| parse_duration_flag("--refresh-interval", &text))
        .transpose()?;

    if let Some(interval) = refresh_interval {
        if interval < Duration::from_secs(1) {
            return Err(ParseError::OutOfRange {
                flag: "--refresh-interval",
                detail: "must be at least 1s".to_string(),
            });
        }
    }

    Ok(ValidatedCli {
        config: cli.config,
        cache_dir: cli.cache_dir,
        cache_size,
        scratch_dir: cli.scratch_dir,
        queue_match,
        amqp_url: cli.amqp_url,
        sqs_region: cli.sqs_region,
        max_tasks: cli.max_tasks,
        idle_timeout,
        refresh_interval,
        lifecycle_file: cli.lifecycle_file,
        verbose: cli.verbose,
    })
}

/// Parses and validates argv in one step.
pub fn parse_and_validate() -> Result<ValidatedCli, ParseError> {
    validate(parse_cli())
}

fn parse_bytes_flag(flag: &'static str, text: &str) -> Result<u64, ParseError> {
    byte_unit::Byte::parse_str(text, true)
        .map(|b| b.as_u64())
        .map_err(|e| ParseError::BadBytes {
            flag,
            detail: e.to_string(),
        })
}

fn parse_duration_flag(flag: &'static str, text: &str) -> Result<Duration, ParseError> {
    humantime::parse_duration(text).map_err(|e| ParseError::BadDuration {
        flag,
        detail: e.to_string(),
    })
}
