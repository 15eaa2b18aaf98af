// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Runner Configuration
//!
//! Layered configuration for the worker process: TOML file, then
//! `RUNNER_`-prefixed environment variables, then CLI flags, with serde
//! defaults underneath. Durations are humanized strings (`"30s"`), byte
//! caps accept `"10gb"` forms.
//!
//! Storage credentials are deliberately absent here: they travel inside
//! each request's `config.env`, never in worker configuration, so tenants
//! sharing a host stay isolated. The TLS triple configured at startup
//! applies to broker connections.

use std::path::PathBuf;
use std::time::Duration;

use experiment_runner_bootstrap::cli::ValidatedCli;
use experiment_runner_domain::RunnerError;
use serde::Deserialize;

/// Serde adapter for humanized duration strings in config files.
mod duration_text {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `"10gb"`-style byte caps in config files.
mod bytes_text {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Count(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(n),
            Raw::Text(t) => experiment_runner_domain::value_objects::resource::parse_bytes(&t)
                .map_err(serde::de::Error::custom),
        }
    }

    pub mod opt {
        use serde::{Deserialize, Deserializer};

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Text(String),
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u64>, D::Error> {
            match Option::<Raw>::deserialize(deserializer)? {
                None => Ok(None),
                Some(Raw::Count(n)) => Ok(Some(n)),
                Some(Raw::Text(t)) => {
                    experiment_runner_domain::value_objects::resource::parse_bytes(&t)
                        .map(Some)
                        .map_err(serde::de::Error::custom)
                }
            }
        }
    }
}

/// Artifact cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory; empty disables caching entirely
    pub dir: PathBuf,

    /// Byte cap the groomer enforces, respected to within one in-flight
    /// download
    #[serde(deserialize_with = "bytes_text::deserialize")]
    pub size: u64,

    /// Groomer wake interval
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub groom_interval: Duration,

    /// Entry time-to-live; hits extend it
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/runner-cache"),
            size: 10_000_000_000,
            groom_interval: Duration::from_secs(60),
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Queue polling and scheduling knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Regex selecting which discovered queues to serve
    pub name_match: String,

    /// Lease/visibility window for one message
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub lease_timeout: Duration,

    /// How often the queue list is re-discovered
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub refresh_interval: Duration,

    /// How long a queue stays deprioritized after a capacity miss
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub penalty_window: Duration,

    /// Exit after this many completed tasks; 0 means unlimited
    pub max_tasks: usize,

    /// Exit after this long without leasing any work; 0 disables
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub idle_timeout: Duration,

    /// Staging failures tolerated before a message is demoted to
    /// bad-request and acked away
    pub staging_attempt_limit: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name_match: "^(sqs_|rmq_)".to_string(),
            lease_timeout: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(60),
            penalty_window: Duration::from_secs(30),
            max_tasks: 0,
            idle_timeout: Duration::ZERO,
            staging_attempt_limit: 3,
        }
    }
}

/// AMQP backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AmqpConfig {
    /// Broker URI, amqp:// or amqps://
    pub url: String,

    /// RabbitMQ management API base URL, used for queue discovery
    pub management_url: String,

    /// Topic exchange whose bindings are enumerated during discovery
    #[serde(default = "AmqpConfig::default_exchange")]
    pub exchange: String,

    /// Routing-key prefix a binding must carry to be considered
    #[serde(default = "AmqpConfig::default_routing_prefix")]
    pub routing_prefix: String,
}

impl AmqpConfig {
    fn default_exchange() -> String {
        "StudioML.topic".to_string()
    }

    fn default_routing_prefix() -> String {
        "StudioML.".to_string()
    }
}

/// SQS backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SqsConfig {
    /// AWS region queues are listed in
    pub region: String,

    /// Optional endpoint override for S3-compatible queue emulators
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Host resource caps. Absent values fall back to detected hardware.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub cpus: Option<u32>,

    #[serde(deserialize_with = "bytes_text::opt::deserialize")]
    pub ram: Option<u64>,
}

/// Scratch-disk accounting.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Device path allocations are tracked against; defaults to the
    /// scratch root
    pub device: Option<PathBuf>,

    /// Soft free-space floor in bytes; default is 15% of the volume
    #[serde(deserialize_with = "bytes_text::opt::deserialize")]
    pub min_free: Option<u64>,
}

/// One GPU card as configured (or discovered by the inventory sidecar and
/// written into the config the worker starts with).
#[derive(Debug, Clone, Deserialize)]
pub struct GpuCardConfig {
    pub uuid: String,

    /// Card capacity in slots (consumer = 2, mid-tier = 4-8, top = 16-24)
    pub slots: u32,

    /// Card memory in bytes
    #[serde(deserialize_with = "bytes_text::deserialize")]
    pub mem: u64,
}

/// Executor knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Mutable-artifact rescan interval; operator-tunable, sane values sit
    /// between 15s and 60s
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub refresh_interval: Duration,

    /// Output log flush cadence, bounds log loss on crash
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub log_flush_interval: Duration,

    /// Grace between the cooperative stop signal and SIGKILL
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub kill_grace: Duration,

    /// Per-artifact stage-in budget
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub stage_timeout: Duration,

    /// Per-upload budget for mutable artifacts
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub deposit_timeout: Duration,

    /// Interpreter used to build the per-request environment
    pub python: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            log_flush_interval: Duration::from_secs(2),
            kill_grace: Duration::from_secs(10),
            stage_timeout: Duration::from_secs(600),
            deposit_timeout: Duration::from_secs(600),
            python: "python3".to_string(),
        }
    }
}

/// Lifecycle-state polling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// File the operator writes `Running | DrainAndTerminate |
    /// DrainAndSuspend` into; absent means signals only
    pub file: Option<PathBuf>,

    #[serde(deserialize_with = "duration_text::deserialize")]
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            file: None,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Mutual-TLS material for broker connections.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Scratch root for per-run working directories
    pub scratch_dir: PathBuf,

    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub amqp: Option<AmqpConfig>,
    pub sqs: Option<SqsConfig>,
    pub limits: LimitsConfig,
    pub disk: DiskConfig,
    pub gpus: Vec<GpuCardConfig>,

    /// Allowed per-card slot divisions for multi-card spans
    pub gpu_divisibles: Vec<u32>,

    pub executor: ExecutorConfig,
    pub lifecycle: LifecycleConfig,
    pub tls: Option<TlsConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("/tmp/runner-scratch"),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            amqp: None,
            sqs: None,
            limits: LimitsConfig::default(),
            disk: DiskConfig::default(),
            gpus: Vec::new(),
            gpu_divisibles: vec![1, 2, 4, 8, 16, 24],
            executor: ExecutorConfig::default(),
            lifecycle: LifecycleConfig::default(),
            tls: None,
        }
    }
}

impl RunnerConfig {
    /// Loads file + environment layers and applies CLI overrides.
    pub fn load(cli: &ValidatedCli) -> Result<Self, RunnerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.clone()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RUNNER")
                .separator("__")
                .try_parsing(true),
        );
        let raw = builder
            .build()
            .map_err(|e| RunnerError::invalid_config(e.to_string()))?;
        let mut loaded: RunnerConfig = raw
            .try_deserialize()
            .map_err(|e| RunnerError::invalid_config(e.to_string()))?;
        loaded.apply_cli(cli);
        loaded.validate()?;
        Ok(loaded)
    }

    fn apply_cli(&mut self, cli: &ValidatedCli) {
        if let Some(dir) = &cli.cache_dir {
            self.cache.dir = dir.clone();
        }
        if let Some(size) = cli.cache_size {
            self.cache.size = size;
        }
        if let Some(dir) = &cli.scratch_dir {
            self.scratch_dir = dir.clone();
        }
        if let Some(pattern) = &cli.queue_match {
            self.queue.name_match = pattern.clone();
        }
        if let Some(url) = &cli.amqp_url {
            match &mut self.amqp {
                Some(amqp) => amqp.url = url.clone(),
                None => {
                    self.amqp = Some(AmqpConfig {
                        url: url.clone(),
                        management_url: String::new(),
                        exchange: AmqpConfig::default_exchange(),
                        routing_prefix: AmqpConfig::default_routing_prefix(),
                    })
                }
            }
        }
        if let Some(region) = &cli.sqs_region {
            match &mut self.sqs {
                Some(sqs) => sqs.region = region.clone(),
                None => {
                    self.sqs = Some(SqsConfig {
                        region: region.clone(),
                        endpoint: None,
                    })
                }
            }
        }
        if let Some(max) = cli.max_tasks {
            self.queue.max_tasks = max;
        }
        if let Some(idle) = cli.idle_timeout {
            self.queue.idle_timeout = idle;
        }
        if let Some(interval) = cli.refresh_interval {
            self.executor.refresh_interval = interval;
        }
        if let Some(file) = &cli.lifecycle_file {
            self.lifecycle.file = Some(file.clone());
        }
    }

    fn validate(&self) -> Result<(), RunnerError> {
        regex::Regex::new(&self.queue.name_match)
            .map_err(|e| RunnerError::invalid_config(format!("queue.name_match: {}", e)))?;
        if self.gpu_divisibles.is_empty() {
            return Err(RunnerError::invalid_config("gpu_divisibles must not be empty"));
        }
        if self.gpu_divisibles.iter().any(|&d| d == 0) {
            return Err(RunnerError::invalid_config("gpu_divisibles must be positive"));
        }
        for card in &self.gpus {
            if card.slots == 0 || card.uuid.is_empty() {
                return Err(RunnerError::invalid_config(format!(
                    "gpu card {:?} needs a uuid and a positive slot count",
                    card.uuid
                )));
            }
        }
        if let Some(tls) = &self.tls {
            for (label, path) in [("ca", &tls.ca), ("cert", &tls.cert), ("key", &tls.key)] {
                if !path.exists() {
                    return Err(RunnerError::invalid_config(format!(
                        "tls.{} file {:?} does not exist",
                        label, path
                    )));
                }
            }
        }
        Ok(())
    }

    /// The device path disk allocations are tracked against.
    pub fn disk_device(&self) -> PathBuf {
        self.disk
            .device
            .clone()
            .unwrap_or_else(|| self.scratch_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = RunnerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.queue.name_match, "^(sqs_|rmq_)");
        assert_eq!(cfg.gpu_divisibles, vec![1, 2, 4, 8, 16, 24]);
        assert_eq!(cfg.executor.refresh_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_cli_overrides() {
        let mut cfg = RunnerConfig::default();
        let cli = ValidatedCli {
            cache_size: Some(42),
            queue_match: Some("^rmq_only".to_string()),
            max_tasks: Some(5),
            ..Default::default()
        };
        cfg.apply_cli(&cli);
        assert_eq!(cfg.cache.size, 42);
        assert_eq!(cfg.queue.name_match, "^rmq_only");
        assert_eq!(cfg.queue.max_tasks, 5);
    }

    #[test]
    fn test_bad_regex_fails_validation() {
        let mut cfg = RunnerConfig::default();
        cfg.queue.name_match = "(unclosed".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_divisibles_rejected() {
        let mut cfg = RunnerConfig::default();
        cfg.gpu_divisibles.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_disk_device_defaults_to_scratch() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.disk_device(), cfg.scratch_dir);
    }
}
