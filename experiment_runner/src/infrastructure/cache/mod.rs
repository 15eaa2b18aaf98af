// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Artifact Cache
//!
//! Content-addressed read-through cache for immutable artifacts. Keys are
//! the storage platform's own content tags; values are raw object blobs on
//! disk plus an in-memory LRU index.
//!
//! ## Single-flight
//!
//! At most one download per hash is in flight, enforced by exclusive
//! creation of a `.partial/<hash>` marker file rather than an in-memory
//! lock, so the property survives process restart and extends across
//! co-located workers sharing the cache volume. Losers of the marker race
//! poll the index (13 s cadence, bounded by the caller's timeout) until
//! the owner publishes.
//!
//! ## Atomic publish
//!
//! The owner taps the raw byte stream into the marker file while staging
//! the artifact, then renames the marker to `<hash>`. Readers only ever
//! see fully-written blobs.
//!
//! ## Grooming
//!
//! Files on disk at construction are imported into the index. The groomer
//! (see [`groomer`]) periodically removes files the index no longer
//! claims, expires idle entries, and keeps the byte footprint at the cap
//! (respected to within one in-flight download).

pub mod groomer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use experiment_runner_domain::{Artifact, RunnerError, StorageService};
use lru::LruCache;
use parking_lot::Mutex;

use crate::infrastructure::config::CacheConfig;
use crate::infrastructure::metrics::MetricsService;
use crate::infrastructure::storage::{archive, ObjectStoreBackend};

/// Default cadence for single-flight wait polling.
const SINGLE_FLIGHT_RETRY: Duration = Duration::from_secs(13);

/// Partial downloads live under this directory inside the cache root.
const PARTIAL_DIR: &str = ".partial";

/// Factory the cache uses to reach storage; injectable so tests can count
/// underlying fetches.
pub type StoreFactory = Box<
    dyn Fn(&Artifact, &BTreeMap<String, String>) -> Result<Arc<dyn StorageService>, RunnerError>
        + Send
        + Sync,
>;

/// One cached blob.
#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
    last_used: Instant,
}

struct CacheIndex {
    lru: LruCache<String, CacheEntry>,
    total_bytes: u64,
}

/// Process-wide artifact cache. Outlives every executor.
pub struct ArtifactCache {
    root: Option<PathBuf>,
    capacity: u64,
    ttl: Duration,
    retry: Duration,
    index: Mutex<CacheIndex>,
    store_factory: StoreFactory,
    metrics: MetricsService,
}

impl ArtifactCache {
    /// Builds the cache, importing any blobs already on disk. An empty
    /// cache dir in configuration disables caching entirely; fetches then
    /// stream straight through.
    pub fn new(config: &CacheConfig, metrics: MetricsService) -> Result<Self, RunnerError> {
        let root = if config.dir.as_os_str().is_empty() {
            None
        } else {
            Some(config.dir.clone())
        };

        let cache = Self {
            root,
            capacity: config.size,
            ttl: config.ttl,
            retry: SINGLE_FLIGHT_RETRY,
            index: Mutex::new(CacheIndex {
                lru: LruCache::unbounded(),
                total_bytes: 0,
            }),
            store_factory: Box::new(|artifact, env| {
                Ok(Arc::new(ObjectStoreBackend::for_artifact(artifact, env)?)
                    as Arc<dyn StorageService>)
            }),
            metrics,
        };

        if let Some(root) = &cache.root {
            std::fs::create_dir_all(root.join(PARTIAL_DIR))?;
            cache.import_existing()?;
        }
        Ok(cache)
    }

    /// Replaces the storage factory. Test seam.
    pub fn with_store_factory(mut self, factory: StoreFactory) -> Self {
        self.store_factory = factory;
        self
    }

    /// Shortens the single-flight poll cadence. Test seam.
    pub fn with_retry_interval(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// True when a blob for `hash` is resident.
    pub fn probe(&self, hash: &str) -> bool {
        self.index.lock().lru.contains(&hash.to_string())
    }

    /// Drops every entry and removes the blobs from disk.
    pub fn clear(&self) -> Result<(), RunnerError> {
        let mut index = self.index.lock();
        while let Some((_, entry)) = index.lru.pop_lru() {
            let _ = std::fs::remove_file(&entry.path);
        }
        index.total_bytes = 0;
        Ok(())
    }

    /// Stages an artifact into `output_dir`, serving from cache when the
    /// platform hash is already resident.
    pub async fn fetch(
        &self,
        artifact: &Artifact,
        env: &BTreeMap<String, String>,
        output_dir: &Path,
        timeout: Duration,
    ) -> Result<Vec<String>, RunnerError> {
        let store = (self.store_factory)(artifact, env)?;

        let root = match &self.root {
            Some(root) => root.clone(),
            // Caching disabled: stream straight through.
            None => {
                return store
                    .fetch(&artifact.key, artifact.unpack, output_dir, None, timeout)
                    .await;
            }
        };

        let mut warnings = Vec::new();
        let hash = match store.hash(&artifact.key, timeout).await {
            Ok(hash) => hash,
            Err(err) if err.is_recoverable() => {
                // Stale-but-valid fallback: the platform is unreachable but
                // the request pinned a hash we still hold.
                if let Some(expected) = &artifact.hash {
                    if let Some(blob) = self.resident_blob(expected) {
                        warnings.push(format!(
                            "storage hash lookup failed ({}), serving cached copy {}",
                            err, expected
                        ));
                        let mut unpack_warnings = self
                            .materialize(&blob, artifact, output_dir)
                            .await?;
                        warnings.append(&mut unpack_warnings);
                        self.metrics.record_cache_hit();
                        return Ok(warnings);
                    }
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if let Some(expected) = &artifact.hash {
            if expected != &hash {
                warnings.push(format!(
                    "artifact {} hash drifted: expected {}, platform reports {}",
                    artifact.key, expected, hash
                ));
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Hit path: touch and materialize from the resident blob.
            if let Some(blob) = self.resident_blob(&hash) {
                self.metrics.record_cache_hit();
                let mut unpack_warnings = self.materialize(&blob, artifact, output_dir).await?;
                warnings.append(&mut unpack_warnings);
                return Ok(warnings);
            }

            let marker = root.join(PARTIAL_DIR).join(&hash);
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&marker)
            {
                Ok(_) => {
                    // We own the marker. The previous owner may have
                    // published between our index check and the create, so
                    // look again before downloading.
                    if let Some(blob) = self.resident_blob(&hash) {
                        let _ = std::fs::remove_file(&marker);
                        self.metrics.record_cache_hit();
                        let mut unpack_warnings =
                            self.materialize(&blob, artifact, output_dir).await?;
                        warnings.append(&mut unpack_warnings);
                        return Ok(warnings);
                    }
                    self.metrics.record_cache_miss();
                    let result = store
                        .fetch(
                            &artifact.key,
                            artifact.unpack,
                            output_dir,
                            Some(marker.clone()),
                            timeout,
                        )
                        .await;
                    match result {
                        Ok(mut fetch_warnings) => {
                            let published = root.join(&hash);
                            std::fs::rename(&marker, &published)?;
                            self.insert(hash.clone(), published)?;
                            self.evict_to_capacity();
                            warnings.append(&mut fetch_warnings);
                            return Ok(warnings);
                        }
                        Err(err) => {
                            let _ = std::fs::remove_file(&marker);
                            return Err(err);
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Another caller is downloading; wait for the publish.
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RunnerError::timeout(format!(
                            "waiting on in-flight download of {}",
                            hash
                        )));
                    }
                    let wait = self.retry.min(deadline - now);
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Archives `src_dir` to the artifact's destination. Deposits never
    /// populate the cache.
    pub async fn deposit(
        &self,
        artifact: &Artifact,
        env: &BTreeMap<String, String>,
        src_dir: &Path,
        timeout: Duration,
    ) -> Result<Vec<String>, RunnerError> {
        let store = (self.store_factory)(artifact, env)?;
        store.deposit(src_dir, &artifact.key, timeout).await
    }

    /// Looks up a resident blob, refreshing its recency and TTL.
    fn resident_blob(&self, hash: &str) -> Option<PathBuf> {
        let mut index = self.index.lock();
        let entry = index.lru.get_mut(&hash.to_string())?;
        if !entry.path.exists() {
            // The file vanished under us; drop the entry.
            let size = entry.size;
            let key = hash.to_string();
            index.lru.pop(&key);
            index.total_bytes = index.total_bytes.saturating_sub(size);
            return None;
        }
        entry.last_used = Instant::now();
        Some(entry.path.clone())
    }

    /// Unpacks or places a cached blob into the caller's output directory.
    async fn materialize(
        &self,
        blob: &Path,
        artifact: &Artifact,
        output_dir: &Path,
    ) -> Result<Vec<String>, RunnerError> {
        let blob = blob.to_path_buf();
        let name = artifact.key.clone();
        let unpack = artifact.unpack;
        let out = output_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if unpack {
                archive::unpack_archive(&blob, &name, &out)
            } else {
                archive::place_file(&blob, &name, &out).map(|_| Vec::new())
            }
        })
        .await
        .map_err(|e| RunnerError::internal(format!("materialize task: {}", e)))?
    }

    fn insert(&self, hash: String, path: PathBuf) -> Result<(), RunnerError> {
        let size = std::fs::metadata(&path)?.len();
        let mut index = self.index.lock();
        if let Some(old) = index.lru.push(
            hash,
            CacheEntry {
                path,
                size,
                last_used: Instant::now(),
            },
        ) {
            index.total_bytes = index.total_bytes.saturating_sub(old.1.size);
        }
        index.total_bytes += size;
        Ok(())
    }

    /// Evicts least-recently-used blobs until the footprint fits the cap.
    fn evict_to_capacity(&self) {
        let mut index = self.index.lock();
        while index.total_bytes > self.capacity {
            match index.lru.pop_lru() {
                Some((_, entry)) => {
                    index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                    let _ = std::fs::remove_file(&entry.path);
                    self.metrics.record_cache_eviction();
                }
                None => break,
            }
        }
    }

    /// Imports blobs already on disk into the index (startup recovery).
    fn import_existing(&self) -> Result<(), RunnerError> {
        let root = match &self.root {
            Some(root) => root,
            None => return Ok(()),
        };
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let hash = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            self.insert(hash, path)?;
        }
        Ok(())
    }

    /// One grooming pass: drop expired entries, remove unclaimed files,
    /// enforce the byte cap. Called by the groomer task.
    pub fn groom(&self) {
        let now = Instant::now();
        let root = match &self.root {
            Some(root) => root.clone(),
            None => return,
        };

        // Expire idle entries.
        let expired: Vec<String> = {
            let index = self.index.lock();
            index
                .lru
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_used) > self.ttl)
                .map(|(k, _)| k.clone())
                .collect()
        };
        {
            let mut index = self.index.lock();
            for key in expired {
                if let Some(entry) = index.lru.pop(&key) {
                    index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                    let _ = std::fs::remove_file(&entry.path);
                    self.metrics.record_cache_eviction();
                }
            }
        }

        // Remove files the index does not claim (stale partials included,
        // once they are old enough to be download wreckage).
        if let Ok(listing) = std::fs::read_dir(&root) {
            for entry in listing.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    continue;
                }
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                if !self.probe(&name) {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        if let Ok(listing) = std::fs::read_dir(root.join(PARTIAL_DIR)) {
            for entry in listing.flatten() {
                let path = entry.path();
                let stale = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .map(|age| age > Duration::from_secs(3600))
                    .unwrap_or(false);
                if stale {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        self.evict_to_capacity();

        // Drop entries whose files vanished outside our control.
        let vanished: Vec<String> = {
            let index = self.index.lock();
            index
                .lru
                .iter()
                .filter(|(_, e)| !e.path.exists())
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut index = self.index.lock();
        for key in vanished {
            if let Some(entry) = index.lru.pop(&key) {
                index.total_bytes = index.total_bytes.saturating_sub(entry.size);
            }
        }
    }

    /// Current byte footprint of resident blobs.
    pub fn footprint(&self) -> u64 {
        self.index.lock().total_bytes
    }
}
