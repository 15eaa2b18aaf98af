// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dispatch Loop
//!
//! The process's top-level scheduler. One loop runs per configured queue
//! backend so independent queue families never block each other; each loop
//! discovers queues, walks them in shuffled order, dry-runs capacity
//! before leasing, and hands matched work to the executor.
//!
//! ## Scheduling policy
//!
//! First-fit across shuffled queues, biased by a penalty box: a queue that
//! just failed the capacity check is skipped for a short window. There is
//! no central planner; every worker is self-directed and the queue is the
//! only coordination point.
//!
//! ## Hints
//!
//! The last successfully parsed resource claim of each queue is persisted
//! under the scratch root. On later iterations the hint lets the loop
//! skip queues whose work cannot fit right now without leasing a message
//! to find out.
//!
//! ## Settlement
//!
//! - executor reports ok - ack
//! - bad request (unparseable, bad scheme, archive escape) - ack with a
//!   failure scrape; poison pills must not recycle
//! - staging failure - nack, with demotion to bad-request after the
//!   configured number of attempts
//! - capacity miss, execution failure - nack for another worker

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use experiment_runner_bootstrap::shutdown::DrainCoordinator;
use experiment_runner_domain::{
    HandlerVerdict, QueueService, Request, Resource, RunnerError, TaskHandler,
};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::application::executor::ExperimentExecutor;
use crate::application::scrape::ScrapeDocument;
use crate::infrastructure::cache::ArtifactCache;
use crate::infrastructure::config::RunnerConfig;
use crate::infrastructure::ledger::ResourceLedger;
use crate::infrastructure::lifecycle::lifecycle_state;
use crate::infrastructure::metrics::MetricsService;

/// Pause between empty sweeps of the queue list.
const SWEEP_PAUSE: Duration = Duration::from_secs(1);

/// Cap on tracked staging-attempt markers. A worker only ever has a
/// handful of requests mid-retry; the cap bounds the map for requests that
/// nacked away to other workers and never came back.
const ATTEMPT_TRACKING_CAP: usize = 1024;

/// Per-queue resource hints, persisted across runs as JSON under the
/// scratch root.
pub struct HintStore {
    path: PathBuf,
    hints: Mutex<HashMap<String, Resource>>,
}

impl HintStore {
    pub fn load(path: PathBuf) -> Self {
        let hints = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            path,
            hints: Mutex::new(hints),
        }
    }

    pub fn get(&self, queue: &str) -> Option<Resource> {
        self.hints.lock().get(queue).cloned()
    }

    pub fn set(&self, queue: &str, resource: Resource) {
        let snapshot = {
            let mut hints = self.hints.lock();
            hints.insert(queue.to_string(), resource);
            hints.clone()
        };
        if let Ok(body) = serde_json::to_string_pretty(&snapshot) {
            if let Some(parent) = self.path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(err) = std::fs::write(&self.path, body) {
                tracing::warn!(error = %err, "hint store write failed");
            }
        }
    }
}

/// Queues sidelined after a capacity miss.
struct PenaltyBox {
    window: Duration,
    until: Mutex<HashMap<String, Instant>>,
}

impl PenaltyBox {
    fn new(window: Duration) -> Self {
        Self {
            window,
            until: Mutex::new(HashMap::new()),
        }
    }

    fn penalize(&self, queue: &str) {
        self.until
            .lock()
            .insert(queue.to_string(), Instant::now() + self.window);
    }

    fn is_penalized(&self, queue: &str) -> bool {
        let mut until = self.until.lock();
        match until.get(queue) {
            Some(deadline) if *deadline > Instant::now() => true,
            Some(_) => {
                until.remove(queue);
                false
            }
            None => false,
        }
    }
}

/// Shared dispatch state; also the [`TaskHandler`] the queue adapters call
/// back into.
pub struct Dispatcher {
    config: RunnerConfig,
    ledger: Arc<ResourceLedger>,
    cache: Arc<ArtifactCache>,
    metrics: MetricsService,
    coordinator: DrainCoordinator,
    host: String,
    hints: HintStore,
    penalties: PenaltyBox,
    attempts: Mutex<LruCache<String, u32>>,
    tasks_done: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        config: RunnerConfig,
        ledger: Arc<ResourceLedger>,
        cache: Arc<ArtifactCache>,
        metrics: MetricsService,
        coordinator: DrainCoordinator,
        host: String,
    ) -> Self {
        let hints = HintStore::load(config.scratch_dir.join("queue-hints.json"));
        let penalties = PenaltyBox::new(config.queue.penalty_window);
        Self {
            config,
            ledger,
            cache,
            metrics,
            coordinator,
            host,
            hints,
            penalties,
            attempts: Mutex::new(LruCache::new(
                NonZeroUsize::new(ATTEMPT_TRACKING_CAP).unwrap_or(NonZeroUsize::MIN),
            )),
            tasks_done: AtomicUsize::new(0),
        }
    }

    pub fn tasks_done(&self) -> usize {
        self.tasks_done.load(Ordering::SeqCst)
    }

    /// Writes the failure scrape for a request that never reached an
    /// executor.
    fn write_failure_scrape(&self, key: &str, digest: &str, error: &RunnerError) {
        let mut scrape = ScrapeDocument::new(self.host.clone(), key, digest);
        scrape.record_error(error);
        scrape.record_status(false, None);
        let dir = self
            .config
            .scratch_dir
            .join("artifact-mappings")
            .join(key);
        if let Err(err) = scrape.write(&dir) {
            tracing::error!(error = %err, stack = "dispatch.write_failure_scrape", "scrape write failed");
        }
    }

    /// Counts a staging attempt for the request; true once the request has
    /// exhausted its budget and must be demoted to bad-request. The marker
    /// is evicted on exhaustion, the message is settled either way.
    fn staging_attempts_exhausted(&self, digest: &str) -> bool {
        let mut attempts = self.attempts.lock();
        let key = digest.to_string();
        let next = attempts.get(&key).copied().unwrap_or(0) + 1;
        if next >= self.config.queue.staging_attempt_limit {
            attempts.pop(&key);
            true
        } else {
            attempts.put(key, next);
            false
        }
    }

    /// Drops the attempt marker once the message is settled; a request
    /// that eventually staged has no further use for its history.
    fn clear_staging_attempts(&self, digest: &str) {
        self.attempts.lock().pop(&digest.to_string());
    }
}

#[async_trait]
impl TaskHandler for Dispatcher {
    async fn handle(&self, cancel: CancellationToken, queue: &str, body: &[u8]) -> HandlerVerdict {
        // Unmarshal and validate.
        let request = match Request::try_from_json(body) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(queue, error = %error, "poison message acked away");
                self.write_failure_scrape("unparsed", "", &error);
                self.metrics.record_ack();
                self.metrics.record_outcome("bad_request");
                return HandlerVerdict {
                    resource: None,
                    ack: true,
                };
            }
        };
        let need = request.experiment.resources_needed.clone();
        let digest = request.digest().unwrap_or_default();

        // Dry-run before touching anything; a mismatch returns the message
        // without side effects.
        if let Err(error) = self.ledger.alloc(&need, request.group(), false) {
            if let RunnerError::InsufficientCapacity { dimension, .. } = &error {
                self.metrics.record_alloc_failure(*dimension);
            }
            tracing::debug!(queue, error = %error, "request does not fit, nacked");
            self.penalties.penalize(queue);
            self.metrics.record_nack();
            return HandlerVerdict::nack();
        }

        // Live allocation.
        let handle = match self.ledger.alloc(&need, request.group(), true) {
            Ok(handle) => handle,
            Err(error) => {
                if let RunnerError::InsufficientCapacity { dimension, .. } = &error {
                    self.metrics.record_alloc_failure(*dimension);
                }
                self.penalties.penalize(queue);
                self.metrics.record_nack();
                return HandlerVerdict::nack();
            }
        };
        self.hints.set(queue, need.clone());

        let executor = match ExperimentExecutor::new(
            request.clone(),
            self.cache.clone(),
            self.config.executor.clone(),
            handle.gpu_uuids(),
            &self.config.scratch_dir,
            self.host.clone(),
        ) {
            Ok(executor) => executor,
            Err(error) => {
                tracing::error!(error = %error, stack = "dispatch.handle/executor.new", "run setup failed");
                self.ledger.release(handle);
                self.metrics.record_nack();
                return HandlerVerdict::nack();
            }
        };

        let _task_guard = self.coordinator.begin_task();
        self.metrics.task_started();
        tracing::info!(
            queue,
            experiment = %request.experiment.key,
            resources = %need,
            "experiment leased"
        );

        let outcome = executor.run(cancel).await;

        // Release strictly after executor exit, before settlement.
        self.ledger.release(handle);
        self.tasks_done.fetch_add(1, Ordering::SeqCst);

        if outcome.ok {
            self.clear_staging_attempts(&digest);
            self.metrics.record_ack();
            self.metrics.task_finished("ok");
            tracing::info!(experiment = %request.experiment.key, "experiment completed");
            return HandlerVerdict::ack(need);
        }

        let error = outcome
            .error
            .unwrap_or_else(|| RunnerError::execution("executor reported failure"));

        if error.is_bad_request() {
            // Poison: redelivery can never succeed.
            tracing::warn!(experiment = %request.experiment.key, error = %error, "bad request acked away");
            self.clear_staging_attempts(&digest);
            self.metrics.record_ack();
            self.metrics.task_finished("bad_request");
            return HandlerVerdict {
                resource: Some(need),
                ack: true,
            };
        }

        if matches!(error, RunnerError::Staging(_)) && self.staging_attempts_exhausted(&digest) {
            tracing::warn!(
                experiment = %request.experiment.key,
                error = %error,
                "staging attempts exhausted, demoting to bad request"
            );
            self.write_failure_scrape(&request.experiment.key, &digest, &error);
            self.metrics.record_ack();
            self.metrics.task_finished("staging_exhausted");
            return HandlerVerdict {
                resource: Some(need),
                ack: true,
            };
        }

        tracing::warn!(experiment = %request.experiment.key, error = %error, "experiment failed, nacked");
        self.metrics.record_nack();
        self.metrics.task_finished("failed");
        HandlerVerdict::nack()
    }
}

/// One dispatch loop per backend credential set.
pub struct DispatchLoop {
    label: String,
    backend: Arc<dyn QueueService>,
    dispatcher: Arc<Dispatcher>,
    filter: Regex,
}

impl DispatchLoop {
    pub fn new(
        label: String,
        backend: Arc<dyn QueueService>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, RunnerError> {
        let filter = Regex::new(&dispatcher.config.queue.name_match)
            .map_err(|e| RunnerError::invalid_config(format!("queue.name_match: {}", e)))?;
        Ok(Self {
            label,
            backend,
            dispatcher,
            filter,
        })
    }

    /// Runs until drained-to-terminate, the task cap, or the idle cap.
    pub async fn run(&self) -> Result<(), RunnerError> {
        let queue_config = &self.dispatcher.config.queue;
        let mut queues: Vec<String> = Vec::new();
        let mut last_discovery: Option<Instant> = None;
        let mut last_lease = Instant::now();

        loop {
            let state = lifecycle_state(&self.dispatcher.coordinator);
            if !state.accepts_work() {
                if self.dispatcher.coordinator.in_flight() == 0 {
                    if state.wants_exit() {
                        tracing::info!(backend = %self.label, "drained, exiting dispatch loop");
                        return Ok(());
                    }
                    // Suspended: idle until the operator resumes us.
                    tokio::time::sleep(SWEEP_PAUSE).await;
                    continue;
                }
                tokio::time::sleep(SWEEP_PAUSE).await;
                continue;
            }

            if queue_config.max_tasks > 0 && self.dispatcher.tasks_done() >= queue_config.max_tasks
            {
                tracing::info!(backend = %self.label, "task cap reached, exiting for replacement");
                return Ok(());
            }
            if !queue_config.idle_timeout.is_zero()
                && last_lease.elapsed() > queue_config.idle_timeout
            {
                tracing::info!(backend = %self.label, "idle cap reached, exiting for replacement");
                return Ok(());
            }

            // Periodic queue discovery.
            let discovery_due = last_discovery
                .map(|t| t.elapsed() >= queue_config.refresh_interval)
                .unwrap_or(true);
            if discovery_due {
                match self
                    .backend
                    .discover(&self.filter, queue_config.lease_timeout)
                    .await
                {
                    Ok(discovered) => {
                        if discovered != queues {
                            tracing::info!(
                                backend = %self.label,
                                queues = discovered.len(),
                                "queue list refreshed"
                            );
                        }
                        queues = discovered;
                        last_discovery = Some(Instant::now());
                    }
                    Err(error) => {
                        tracing::warn!(backend = %self.label, error = %error, "queue discovery failed");
                        last_discovery = Some(Instant::now());
                    }
                }
            }

            // First-fit across shuffled queues.
            let mut sweep: Vec<String> = queues.clone();
            sweep.shuffle(&mut rand::rng());
            let mut handled_any = false;
            for queue in &sweep {
                if self.dispatcher.penalties.is_penalized(queue) {
                    continue;
                }
                // Sizing hint from a previous lease: skip without leasing
                // when the host cannot fit it right now.
                if let Some(hint) = self.dispatcher.hints.get(queue) {
                    if self.dispatcher.ledger.alloc(&hint, "", false).is_err() {
                        self.dispatcher.penalties.penalize(queue);
                        continue;
                    }
                }

                let cancel = self.dispatcher.coordinator.token().child_token();
                match self
                    .backend
                    .work(
                        cancel,
                        queue_config.lease_timeout,
                        queue,
                        self.dispatcher.as_ref(),
                    )
                    .await
                {
                    Ok(outcome) if outcome.handled > 0 => {
                        handled_any = true;
                        last_lease = Instant::now();
                        // One task per sweep; capacity changed, re-plan.
                        break;
                    }
                    Ok(_) => {}
                    Err(error) if error.is_recoverable() => {
                        tracing::warn!(queue = %queue, error = %error, "transient queue fault");
                    }
                    Err(error) => {
                        tracing::error!(queue = %queue, error = %error, stack = "dispatch.run/work", "queue fault");
                    }
                }
            }

            if !handled_any {
                tokio::time::sleep(SWEEP_PAUSE).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_runner_bootstrap::platform::{Platform, PlatformError};
    use experiment_runner_bootstrap::shutdown::DrainKind;
    use experiment_runner_domain::WorkOutcome;
    use std::path::Path;

    const GIB: u64 = 1 << 30;

    struct FakeHost;

    impl Platform for FakeHost {
        fn platform_name(&self) -> &'static str {
            "test"
        }
        fn cpu_count(&self) -> usize {
            8
        }
        fn total_memory(&self) -> Result<u64, PlatformError> {
            Ok(32 * GIB)
        }
        fn available_memory(&self) -> Result<u64, PlatformError> {
            Ok(16 * GIB)
        }
        fn disk_total(&self, _path: &Path) -> Result<u64, PlatformError> {
            Ok(100 * GIB)
        }
        fn disk_free(&self, _path: &Path) -> Result<u64, PlatformError> {
            Ok(80 * GIB)
        }
        fn hostname(&self) -> String {
            "test-host".into()
        }
    }

    struct EmptyQueue;

    #[async_trait]
    impl QueueService for EmptyQueue {
        async fn discover(
            &self,
            _filter: &Regex,
            _timeout: Duration,
        ) -> Result<Vec<String>, RunnerError> {
            Ok(vec!["rmq_idle".to_string()])
        }

        async fn exists(&self, _name: &str) -> Result<bool, RunnerError> {
            Ok(true)
        }

        async fn work(
            &self,
            _cancel: CancellationToken,
            _lease: Duration,
            _name: &str,
            _handler: &dyn TaskHandler,
        ) -> Result<WorkOutcome, RunnerError> {
            Ok(WorkOutcome::default())
        }
    }

    fn test_dispatcher(scratch: &Path) -> Arc<Dispatcher> {
        let mut config = RunnerConfig::default();
        config.scratch_dir = scratch.to_path_buf();
        config.cache.dir = scratch.join("cache");
        config.disk.min_free = Some(GIB);
        let metrics = MetricsService::new().unwrap();
        let ledger =
            Arc::new(ResourceLedger::new(&config, Arc::new(FakeHost)).unwrap());
        let cache = Arc::new(ArtifactCache::new(&config.cache, metrics.clone()).unwrap());
        Arc::new(Dispatcher::new(
            config,
            ledger,
            cache,
            metrics,
            DrainCoordinator::default(),
            "test-host".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_poison_message_is_acked_with_scrape() {
        let scratch = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(scratch.path());
        let verdict = dispatcher
            .handle(CancellationToken::new(), "rmq_test", b"{definitely not json")
            .await;
        assert!(verdict.ack);
        assert!(verdict.resource.is_none());

        let mapping_dir = scratch.path().join("artifact-mappings/unparsed");
        let scrapes: Vec<_> = std::fs::read_dir(&mapping_dir).unwrap().collect();
        assert_eq!(scrapes.len(), 1);
    }

    #[tokio::test]
    async fn test_unfit_request_is_nacked() {
        let scratch = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(scratch.path());
        // No GPUs on this host
        let body = br#"{
            "experiment": {"key": "exp-gpu", "filename": "t.py",
                           "resources_needed": {"cpus":1,"gpus":8,"hdd":"1gb","ram":"1gb","gpuMem":"8gb"}},
            "config": {}
        }"#;
        let verdict = dispatcher
            .handle(CancellationToken::new(), "rmq_test", body)
            .await;
        assert!(!verdict.ack);
        // A capacity miss penalizes the queue for the next sweep
        assert!(dispatcher.penalties.is_penalized("rmq_test"));
    }

    #[tokio::test]
    async fn test_corrupt_archive_retries_then_demotes() {
        let scratch = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        // A workspace object that downloads fine but never extracts.
        std::fs::write(store.path().join("ws.tgz"), b"this is not gzip data").unwrap();

        let body = serde_json::json!({
            "experiment": {
                "key": "exp-corrupt",
                "filename": "train.py",
                "artifacts": {
                    "workspace": {
                        "qualified": format!("file://{}/ws.tgz", store.path().display()),
                        "bucket": store.path().to_str().unwrap(),
                        "key": "ws.tgz",
                        "unpack": true
                    }
                },
                "resources_needed": {"cpus": 1, "gpus": 0, "hdd": "1gb", "ram": "1gb", "gpuMem": 0}
            },
            "config": {}
        })
        .to_string();

        let dispatcher = test_dispatcher(scratch.path());

        // Default attempt limit is 3: the first two corrupt downloads nack
        // for redelivery.
        for _ in 0..2 {
            let verdict = dispatcher
                .handle(CancellationToken::new(), "rmq_test", body.as_bytes())
                .await;
            assert!(!verdict.ack);
        }

        // The third exhausts the budget: demoted to bad-request, acked,
        // failure scrape written.
        let verdict = dispatcher
            .handle(CancellationToken::new(), "rmq_test", body.as_bytes())
            .await;
        assert!(verdict.ack);
        let scrapes = std::fs::read_dir(scratch.path().join("artifact-mappings/exp-corrupt"))
            .unwrap()
            .count();
        assert!(scrapes >= 1);

        // The marker was evicted on demotion: a redelivery starts counting
        // from scratch and nacks again.
        let verdict = dispatcher
            .handle(CancellationToken::new(), "rmq_test", body.as_bytes())
            .await;
        assert!(!verdict.ack);
    }

    #[tokio::test]
    async fn test_hint_store_round_trip() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("hints.json");
        let store = HintStore::load(path.clone());
        assert!(store.get("rmq_a").is_none());

        let resource = Resource {
            cpus: 2,
            gpus: 1,
            hdd: GIB,
            ram: GIB,
            gpu_mem: GIB,
        };
        store.set("rmq_a", resource.clone());
        assert_eq!(store.get("rmq_a"), Some(resource.clone()));

        // Reload from disk: persisted across runs
        let reloaded = HintStore::load(path);
        assert_eq!(reloaded.get("rmq_a"), Some(resource));
    }

    #[tokio::test]
    async fn test_penalty_box_expires() {
        let penalties = PenaltyBox::new(Duration::from_millis(30));
        penalties.penalize("rmq_a");
        assert!(penalties.is_penalized("rmq_a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!penalties.is_penalized("rmq_a"));
        assert!(!penalties.is_penalized("rmq_b"));
    }

    #[tokio::test]
    async fn test_loop_exits_on_drain_terminate() {
        let scratch = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(scratch.path());
        let dispatch_loop = DispatchLoop::new(
            "test".to_string(),
            Arc::new(EmptyQueue),
            dispatcher.clone(),
        )
        .unwrap();

        let coordinator = dispatcher.coordinator.clone();
        let runner = tokio::spawn(async move { dispatch_loop.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.request_drain(DrainKind::Terminate);

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("loop did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_loop_exits_on_idle_cap() {
        let scratch = tempfile::tempdir().unwrap();
        let mut config = RunnerConfig::default();
        config.scratch_dir = scratch.path().to_path_buf();
        config.cache.dir = scratch.path().join("cache");
        config.disk.min_free = Some(GIB);
        config.queue.idle_timeout = Duration::from_millis(100);
        let metrics = MetricsService::new().unwrap();
        let ledger = Arc::new(ResourceLedger::new(&config, Arc::new(FakeHost)).unwrap());
        let cache = Arc::new(ArtifactCache::new(&config.cache, metrics.clone()).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            ledger,
            cache,
            metrics,
            DrainCoordinator::default(),
            "test-host".to_string(),
        ));
        let dispatch_loop =
            DispatchLoop::new("test".to_string(), Arc::new(EmptyQueue), dispatcher).unwrap();

        tokio::time::timeout(Duration::from_secs(10), dispatch_loop.run())
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
