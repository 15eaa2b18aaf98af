// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Experiment Executor
//!
//! Per-request sandbox builder and process supervisor. One executor owns
//! one run: it stages inputs through the artifact cache, composes an
//! environment-setup script, supervises the child process, pumps its
//! output into the buffered log and the scrape document, re-uploads
//! changed mutable artifacts on an interval, and tears everything down on
//! exit.
//!
//! ## Run layout
//!
//! ```text
//! <scratch>/_runner/runner.sh         generated launcher script
//! <scratch>/workspace/<role>/...      staged input artifacts
//! <scratch>/output/output             captured stdout/stderr
//! <scratch>/artifact-mappings/<key>/  scrape documents
//! ```
//!
//! ## Termination
//!
//! The child ends on the first of: its own exit, the request's
//! max-duration, or cancellation (lifecycle drain or lease abandonment).
//! Stop is cooperative first (SIGTERM), hard after the configured grace.
//! A scrape document is written on every path, including catastrophic
//! ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use experiment_runner_domain::{Artifact, Request, RunnerError};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::application::scrape::ScrapeDocument;
use crate::infrastructure::cache::ArtifactCache;
use crate::infrastructure::config::ExecutorConfig;

/// Result of one run, consumed by the dispatcher's settlement logic.
#[derive(Debug)]
pub struct ExecutorOutcome {
    /// True when the child exited zero with no runner-side error
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub error: Option<RunnerError>,
    pub scrape_path: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Per-run directory layout.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub scratch: PathBuf,
    pub runner_dir: PathBuf,
    pub workspace: PathBuf,
    pub output_dir: PathBuf,
    pub blob_cache: PathBuf,
    pub queue_dir: PathBuf,
    pub mappings_dir: PathBuf,
}

impl RunLayout {
    /// Allocates a unique scratch directory and the standard subtree.
    pub fn create(scratch_root: &Path, experiment_key: &str) -> Result<Self, RunnerError> {
        let scratch = scratch_root.join(format!("{}-{}", experiment_key, uuid::Uuid::new_v4()));
        let layout = Self {
            runner_dir: scratch.join("_runner"),
            workspace: scratch.join("workspace"),
            output_dir: scratch.join("output"),
            blob_cache: scratch.join("blob-cache"),
            queue_dir: scratch.join("queue"),
            mappings_dir: scratch.join("artifact-mappings").join(experiment_key),
            scratch,
        };
        for dir in [
            &layout.runner_dir,
            &layout.workspace,
            &layout.output_dir,
            &layout.blob_cache,
            &layout.queue_dir,
            &layout.mappings_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(layout)
    }
}

/// Single-quotes a string for the generated shell script.
fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r#"'\''"#))
}

/// Rewrites an interpreter package to its accelerator variant when the run
/// holds a GPU.
fn accelerate_package(package: &str, gpu: bool) -> String {
    if !gpu {
        return package.to_string();
    }
    for (plain, accelerated) in [("tensorflow", "tensorflow-gpu"), ("tf-nightly", "tf-nightly-gpu")]
    {
        if package == plain {
            return accelerated.to_string();
        }
        if let Some(version) = package.strip_prefix(&format!("{}==", plain)) {
            return format!("{}=={}", accelerated, version);
        }
    }
    package.to_string()
}

/// Hashes the sorted file-info tuples of a tree. Uploads fire only when
/// this changes between scans, so unchanged workspaces never re-upload.
pub fn tree_fingerprint(dir: &Path) -> Result<String, RunnerError> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<(String, u64, u64)>) -> std::io::Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.path());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, out)?;
            } else {
                let meta = entry.metadata()?;
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                out.push((rel, meta.len(), mtime));
            }
        }
        Ok(())
    }

    let mut tuples = Vec::new();
    walk(dir, dir, &mut tuples).map_err(|e| RunnerError::io_error(e.to_string()))?;
    tuples.sort();
    let mut hasher = Sha256::new();
    for (path, size, mtime) in tuples {
        hasher.update(path.as_bytes());
        hasher.update(size.to_le_bytes());
        hasher.update(mtime.to_le_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One mutable artifact under stage-out tracking.
struct MutableArtifact {
    artifact: Artifact,
    dir: PathBuf,
}

/// Per-request sandbox builder and supervisor.
pub struct ExperimentExecutor {
    request: Request,
    layout: RunLayout,
    cache: Arc<ArtifactCache>,
    config: ExecutorConfig,
    gpu_uuids: Vec<String>,
    host: String,
}

impl ExperimentExecutor {
    pub fn new(
        request: Request,
        cache: Arc<ArtifactCache>,
        config: ExecutorConfig,
        gpu_uuids: Vec<String>,
        scratch_root: &Path,
        host: String,
    ) -> Result<Self, RunnerError> {
        let layout = RunLayout::create(scratch_root, &request.experiment.key)?;
        Ok(Self {
            request,
            layout,
            cache,
            config,
            gpu_uuids,
            host,
        })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// The directory the entry point runs in: the conventional `workspace`
    /// role when staged, the workspace root otherwise.
    fn work_dir(&self) -> PathBuf {
        let conventional = self.layout.workspace.join("workspace");
        if self.request.experiment.artifacts.contains_key("workspace") {
            conventional
        } else {
            self.layout.workspace.clone()
        }
    }

    /// Renders the environment-setup launcher script.
    fn render_script(&self) -> String {
        let experiment = &self.request.experiment;
        let venv = self.layout.runner_dir.join("venv");
        let mut lines: Vec<String> = Vec::new();

        lines.push("#!/bin/bash".to_string());
        lines.push("set -euo pipefail".to_string());
        lines.push(String::new());

        lines.push(format!(
            "export EXPERIMENT_KEY={}",
            sh_quote(&experiment.key)
        ));
        lines.push(format!(
            "export PROJECT_ID={}",
            sh_quote(self.request.project_id())
        ));
        if !self.gpu_uuids.is_empty() {
            // Set-union of every card loaned to this request.
            lines.push(format!(
                "export CUDA_VISIBLE_DEVICES={}",
                sh_quote(&self.gpu_uuids.join(","))
            ));
        }
        for (key, value) in &self.request.config.env {
            lines.push(format!("export {}={}", key, sh_quote(value)));
        }
        lines.push(String::new());

        lines.push(format!(
            "{} -m venv {}",
            sh_quote(&self.config.python),
            sh_quote(&venv.to_string_lossy())
        ));
        lines.push(format!(
            "source {}/bin/activate",
            sh_quote(&venv.to_string_lossy())
        ));
        lines.push("python -m pip install --quiet --upgrade pip setuptools wheel".to_string());

        let gpu = !self.gpu_uuids.is_empty();
        let packages: Vec<String> = experiment
            .python_env
            .iter()
            .chain(self.request.config.pip.iter())
            .map(|p| accelerate_package(p, gpu))
            .collect();
        if !packages.is_empty() {
            let quoted: Vec<String> = packages.iter().map(|p| sh_quote(p)).collect();
            lines.push(format!("pip install --quiet {}", quoted.join(" ")));
        }

        // A platform package bundled with the workspace overrides any
        // pinned version.
        let dist_glob = self.layout.workspace.join("dist").join("*.whl");
        lines.push(format!(
            "if compgen -G {} > /dev/null; then pip install --quiet --force-reinstall {}; fi",
            sh_quote(&dist_glob.to_string_lossy()),
            dist_glob.to_string_lossy()
        ));
        lines.push(String::new());

        lines.push(format!("cd {}", sh_quote(&self.work_dir().to_string_lossy())));
        let mut exec_line = format!("exec python {}", sh_quote(&experiment.filename));
        for arg in &experiment.args {
            exec_line.push(' ');
            exec_line.push_str(&sh_quote(arg));
        }
        lines.push(exec_line);
        lines.push(String::new());
        lines.join("\n")
    }

    fn write_script(&self) -> Result<PathBuf, RunnerError> {
        let path = self.layout.runner_dir.join("runner.sh");
        std::fs::write(&path, self.render_script())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(path)
    }

    /// Stages every artifact; returns the mutable set for stage-out.
    async fn stage_in(&self) -> Result<(Vec<MutableArtifact>, Vec<String>), RunnerError> {
        let mut mutables = Vec::new();
        let mut warnings = Vec::new();
        for (role, artifact) in &self.request.experiment.artifacts {
            let sub = artifact.local.clone().unwrap_or_else(|| role.clone());
            let dest = self.layout.workspace.join(&sub);
            let mut fetched = self
                .cache
                .fetch(
                    artifact,
                    &self.request.config.env,
                    &dest,
                    self.config.stage_timeout,
                )
                .await
                .map_err(|e| {
                    // An escaping archive condemns the request itself;
                    // everything else, corruption included, is a staging
                    // fault worth retrying from the queue.
                    if e.is_bad_request() {
                        e
                    } else {
                        RunnerError::Staging(format!("artifact {:?}: {}", role, e))
                    }
                })?;
            warnings.append(&mut fetched);
            if artifact.mutable {
                mutables.push(MutableArtifact {
                    artifact: artifact.clone(),
                    dir: dest,
                });
            }
        }
        Ok((mutables, warnings))
    }

    /// Uploads mutable artifacts whose tree fingerprints moved since the
    /// previous scan. Serialized per run by construction (one caller).
    async fn upload_mutables(
        &self,
        mutables: &[MutableArtifact],
        fingerprints: &mut HashMap<String, String>,
        warnings: &mut Vec<String>,
    ) {
        for mutable in mutables {
            let dir = mutable.dir.clone();
            let print = match tokio::task::spawn_blocking(move || tree_fingerprint(&dir)).await {
                Ok(Ok(print)) => print,
                Ok(Err(err)) => {
                    warnings.push(format!(
                        "fingerprint of {:?} failed: {}",
                        mutable.artifact.key, err
                    ));
                    continue;
                }
                Err(err) => {
                    warnings.push(format!("fingerprint task died: {}", err));
                    continue;
                }
            };
            if fingerprints.get(&mutable.artifact.key) == Some(&print) {
                continue;
            }
            match self
                .cache
                .deposit(
                    &mutable.artifact,
                    &self.request.config.env,
                    &mutable.dir,
                    self.config.deposit_timeout,
                )
                .await
            {
                Ok(_) => {
                    fingerprints.insert(mutable.artifact.key.clone(), print);
                }
                Err(err) => {
                    warnings.push(format!(
                        "upload of {:?} failed: {}",
                        mutable.artifact.key, err
                    ));
                }
            }
        }
    }

    #[cfg(unix)]
    fn signal_stop(child: &Child) {
        if let Some(pid) = child.id() {
            // Cooperative stop; SIGKILL follows after the grace.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_stop(_child: &Child) {}

    /// Stops the child: cooperative signal, grace, then hard kill.
    async fn terminate(&self, child: &mut Child) {
        Self::signal_stop(child);
        let graceful =
            tokio::time::timeout(self.config.kill_grace, child.wait()).await;
        if graceful.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Runs the experiment to completion. Never panics across this
    /// boundary; failures come back inside the outcome.
    pub async fn run(&self, cancel: CancellationToken) -> ExecutorOutcome {
        let digest = self.request.digest().unwrap_or_default();
        let scrape = Arc::new(Mutex::new(ScrapeDocument::new(
            self.host.clone(),
            &self.request.experiment.key,
            &digest,
        )));

        let mut outcome = self.supervise(cancel, scrape.clone()).await;

        // A scrape is written on every path, catastrophic ones included.
        {
            let mut scrape = scrape.lock();
            if let Some(error) = &outcome.error {
                scrape.record_error(error);
            }
            scrape.record_status(outcome.ok, outcome.exit_code);
            match scrape.write(&self.layout.mappings_dir) {
                Ok(path) => outcome.scrape_path = Some(path),
                Err(err) => {
                    tracing::error!(error = %err, stack = "executor.run/scrape.write", "scrape write failed");
                }
            }
        }
        outcome
    }

    async fn supervise(
        &self,
        cancel: CancellationToken,
        scrape: Arc<Mutex<ScrapeDocument>>,
    ) -> ExecutorOutcome {
        let mut warnings = Vec::new();

        // Stage inputs.
        let (mutables, mut stage_warnings) = match self.stage_in().await {
            Ok(staged) => staged,
            Err(error) => {
                return ExecutorOutcome {
                    ok: false,
                    exit_code: None,
                    error: Some(error),
                    scrape_path: None,
                    warnings,
                };
            }
        };
        warnings.append(&mut stage_warnings);

        // Compose and launch the environment script.
        let script = match self.write_script() {
            Ok(script) => script,
            Err(error) => {
                return ExecutorOutcome {
                    ok: false,
                    exit_code: None,
                    error: Some(error),
                    scrape_path: None,
                    warnings,
                };
            }
        };

        let mut command = Command::new("bash");
        command
            .arg(&script)
            .current_dir(&self.layout.scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The child sees only what the script exports plus the bare
        // process basics; worker credentials never leak in.
        command.env_clear();
        for key in ["PATH", "HOME", "LANG", "TMPDIR"] {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecutorOutcome {
                    ok: false,
                    exit_code: None,
                    error: Some(RunnerError::execution(format!("spawn: {}", err))),
                    scrape_path: None,
                    warnings,
                };
            }
        };

        // Output pumps: stdout is scanned for JSON metadata lines, all
        // other lines land in the buffered output log, flushed on an
        // interval to bound loss on crash.
        let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(256);
        let output_path = self.layout.output_dir.join("output");
        let flush_interval = self.config.log_flush_interval;
        let writer_task = tokio::spawn(async move {
            let file = match tokio::fs::File::create(&output_path).await {
                Ok(file) => file,
                Err(err) => {
                    tracing::error!(error = %err, "output log create failed");
                    return;
                }
            };
            let mut writer = BufWriter::new(file);
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    line = line_rx.recv() => match line {
                        Some(line) => {
                            let _ = writer.write_all(line.as_bytes()).await;
                            let _ = writer.write_all(b"\n").await;
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        let _ = writer.flush().await;
                    }
                }
            }
            let _ = writer.flush().await;
        });

        let stdout = child.stdout.take();
        let stdout_scrape = scrape.clone();
        let stdout_tx = line_tx.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let merged = stdout_scrape.lock().ingest_line(&line);
                    if !merged {
                        let _ = stdout_tx.send(line).await;
                    }
                }
            }
        });

        let stderr = child.stderr.take();
        let stderr_tx = line_tx.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stderr_tx.send(line).await;
                }
            }
        });
        drop(line_tx);

        // Supervise: child exit, max-duration, or cancellation.
        let max_duration = self.request.experiment.max_duration;
        let deadline = tokio::time::Instant::now()
            + if max_duration.is_zero() {
                Duration::from_secs(0)
            } else {
                max_duration
            };
        let mut fingerprints: HashMap<String, String> = HashMap::new();
        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        refresh.tick().await; // skip the immediate tick

        let mut error: Option<RunnerError> = None;
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => break Some(status),
                        Err(err) => {
                            error = Some(RunnerError::execution(format!("wait: {}", err)));
                            break None;
                        }
                    }
                }
                _ = refresh.tick() => {
                    self.upload_mutables(&mutables, &mut fingerprints, &mut warnings).await;
                }
                _ = tokio::time::sleep_until(deadline), if !max_duration.is_zero() => {
                    error = Some(RunnerError::timeout(format!(
                        "max duration {} elapsed",
                        humantime::format_duration(max_duration)
                    )));
                    self.terminate(&mut child).await;
                    break None;
                }
                _ = cancel.cancelled() => {
                    error = Some(RunnerError::Cancelled("lifecycle or lease cancelled".into()));
                    self.terminate(&mut child).await;
                    break None;
                }
            }
        };

        // Drain the pumps, then the writer.
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let _ = writer_task.await;

        // Final mutable-artifact upload.
        self.upload_mutables(&mutables, &mut fingerprints, &mut warnings).await;

        let exit_code = status.and_then(|s| s.code());
        let ok = error.is_none() && status.map(|s| s.success()).unwrap_or(false);
        if !ok && error.is_none() {
            error = Some(RunnerError::execution(format!(
                "child exited with status {:?}",
                exit_code
            )));
        }

        ExecutorOutcome {
            ok,
            exit_code,
            error,
            scrape_path: None,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::CacheConfig;
    use crate::infrastructure::metrics::MetricsService;
    use experiment_runner_domain::Experiment;

    fn test_cache(dir: &Path) -> Arc<ArtifactCache> {
        let config = CacheConfig {
            dir: dir.to_path_buf(),
            ..Default::default()
        };
        Arc::new(ArtifactCache::new(&config, MetricsService::new().unwrap()).unwrap())
    }

    fn request_with_packages(packages: Vec<&str>) -> Request {
        Request {
            experiment: Experiment {
                key: "exp-t".to_string(),
                filename: "train.py".to_string(),
                args: vec!["--epochs".to_string(), "2".to_string()],
                python_env: packages.into_iter().map(String::from).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn executor(request: Request, gpus: Vec<String>, root: &Path) -> ExperimentExecutor {
        let cache_dir = root.join("cache");
        ExperimentExecutor::new(
            request,
            test_cache(&cache_dir),
            ExecutorConfig::default(),
            gpus,
            &root.join("scratch"),
            "test-host".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_sh_quote_survives_quotes() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn test_accelerate_package_rewrites() {
        assert_eq!(accelerate_package("tensorflow", true), "tensorflow-gpu");
        assert_eq!(
            accelerate_package("tensorflow==2.4", true),
            "tensorflow-gpu==2.4"
        );
        assert_eq!(accelerate_package("tensorflow==2.4", false), "tensorflow==2.4");
        assert_eq!(accelerate_package("numpy==1.24", true), "numpy==1.24");
        assert_eq!(accelerate_package("tf-nightly", true), "tf-nightly-gpu");
    }

    #[test]
    fn test_layout_creates_standard_tree() {
        let root = tempfile::tempdir().unwrap();
        let layout = RunLayout::create(root.path(), "exp-1").unwrap();
        assert!(layout.runner_dir.is_dir());
        assert!(layout.workspace.is_dir());
        assert!(layout.output_dir.is_dir());
        assert!(layout.blob_cache.is_dir());
        assert!(layout.queue_dir.is_dir());
        assert!(layout.mappings_dir.is_dir());
        assert!(layout.mappings_dir.ends_with("artifact-mappings/exp-1"));
    }

    #[test]
    fn test_script_exports_and_rewrites() {
        let root = tempfile::tempdir().unwrap();
        let mut request = request_with_packages(vec!["tensorflow==2.4", "numpy==1.24"]);
        request
            .config
            .env
            .insert("AWS_ACCESS_KEY_ID".to_string(), "AK".to_string());
        let exec = executor(request, vec!["uuid-a".to_string(), "uuid-b".to_string()], root.path());

        let script = exec.render_script();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("export EXPERIMENT_KEY='exp-t'"));
        assert!(script.contains("export CUDA_VISIBLE_DEVICES='uuid-a,uuid-b'"));
        assert!(script.contains("export AWS_ACCESS_KEY_ID='AK'"));
        assert!(script.contains("'tensorflow-gpu==2.4'"));
        assert!(script.contains("'numpy==1.24'"));
        assert!(script.contains("-m venv"));
        assert!(script.contains("exec python 'train.py' '--epochs' '2'"));
    }

    #[test]
    fn test_script_without_gpu_keeps_plain_packages() {
        let root = tempfile::tempdir().unwrap();
        let request = request_with_packages(vec!["tensorflow==2.4"]);
        let exec = executor(request, Vec::new(), root.path());
        let script = exec.render_script();
        assert!(!script.contains("CUDA_VISIBLE_DEVICES"));
        assert!(script.contains("'tensorflow==2.4'"));
    }

    #[test]
    fn test_tree_fingerprint_tracks_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        let first = tree_fingerprint(dir.path()).unwrap();
        let again = tree_fingerprint(dir.path()).unwrap();
        assert_eq!(first, again);

        std::fs::write(dir.path().join("b.txt"), b"two").unwrap();
        let changed = tree_fingerprint(dir.path()).unwrap();
        assert_ne!(first, changed);
    }

    // Exercises a real child process; needs bash and python3 on PATH.
    #[tokio::test]
    #[ignore]
    async fn test_full_run_merges_stdout_metadata() {
        let root = tempfile::tempdir().unwrap();
        let mut request = request_with_packages(vec![]);
        request.experiment.filename = "emit.py".to_string();
        request.experiment.args.clear();
        let exec = executor(request, Vec::new(), root.path());

        std::fs::write(
            exec.layout().workspace.join("emit.py"),
            b"import json\nprint(json.dumps({'loss': 0.1}))\nprint('plain line')\n",
        )
        .unwrap();

        let outcome = exec.run(CancellationToken::new()).await;
        assert!(outcome.ok, "outcome: {:?}", outcome);
        let scrape = std::fs::read_to_string(outcome.scrape_path.unwrap()).unwrap();
        assert!(scrape.contains("\"loss\""));
        let log = std::fs::read_to_string(exec.layout().output_dir.join("output")).unwrap();
        assert!(log.contains("plain line"));
        assert!(!log.contains("loss"));
    }
}
