// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! End-to-end staging through the real stack: local object store, archive
//! codec, and the content-addressed cache.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use experiment_runner::infrastructure::cache::ArtifactCache;
use experiment_runner::infrastructure::config::CacheConfig;
use experiment_runner::infrastructure::metrics::MetricsService;
use experiment_runner_domain::{Artifact, RunnerError, StorageService};

fn local_artifact(store_root: &Path, key: &str, unpack: bool) -> Artifact {
    Artifact {
        bucket: store_root.to_str().unwrap().to_string(),
        key: key.to_string(),
        qualified: format!("file://{}/{}", store_root.display(), key),
        unpack,
        ..Default::default()
    }
}

fn cache_at(dir: &Path) -> (ArtifactCache, MetricsService) {
    let metrics = MetricsService::new().unwrap();
    let config = CacheConfig {
        dir: dir.to_path_buf(),
        ..Default::default()
    };
    (ArtifactCache::new(&config, metrics.clone()).unwrap(), metrics)
}

#[tokio::test]
async fn deposit_then_fetch_round_trips_a_tree() {
    let store_root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let (cache, metrics) = cache_at(cache_dir.path());

    // Author a workspace and deposit it as a tarball.
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("train.py"), b"print('v1')\n").unwrap();
    std::fs::create_dir_all(src.path().join("conf")).unwrap();
    std::fs::write(src.path().join("conf/settings.yaml"), b"epochs: 2\n").unwrap();

    let artifact = local_artifact(store_root.path(), "ws/workspace.tgz", true);
    let env = BTreeMap::new();
    cache
        .deposit(&artifact, &env, src.path(), Duration::from_secs(30))
        .await
        .unwrap();

    // First fetch misses, second hits; both materialize the same tree.
    let out1 = tempfile::tempdir().unwrap();
    cache
        .fetch(&artifact, &env, out1.path(), Duration::from_secs(30))
        .await
        .unwrap();
    let out2 = tempfile::tempdir().unwrap();
    cache
        .fetch(&artifact, &env, out2.path(), Duration::from_secs(30))
        .await
        .unwrap();

    for out in [&out1, &out2] {
        assert_eq!(
            std::fs::read(out.path().join("train.py")).unwrap(),
            b"print('v1')\n"
        );
        assert_eq!(
            std::fs::read(out.path().join("conf/settings.yaml")).unwrap(),
            b"epochs: 2\n"
        );
    }
    assert_eq!(metrics.cache_misses(), 1);
    assert_eq!(metrics.cache_hits(), 1);
}

#[tokio::test]
async fn escaping_archive_is_rejected_without_side_effects() {
    let store_root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let (cache, _metrics) = cache_at(cache_dir.path());

    // Hand-build a tarball whose member climbs out of the extraction root
    // and plant it directly in the local store.
    let evil_path = store_root.path().join("evil.tar");
    {
        let file = std::fs::File::create(&evil_path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        let name = b"../../etc/passwd";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"oops"[..]).unwrap();
        builder.finish().unwrap();
    }

    let artifact = local_artifact(store_root.path(), "evil.tar", true);
    let out = tempfile::tempdir().unwrap();
    let err = cache
        .fetch(&artifact, &BTreeMap::new(), out.path(), Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::BadArchive(_)));
    assert!(err.is_bad_request());
    // Nothing escaped the output directory.
    assert!(!out.path().join("../etc/passwd").exists());
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn unpacked_false_places_raw_object() {
    let store_root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let (cache, _metrics) = cache_at(cache_dir.path());

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("weights.txt"), b"w").unwrap();
    let artifact = local_artifact(store_root.path(), "runs/out.tgz", false);
    let env = BTreeMap::new();
    cache
        .deposit(&artifact, &env, src.path(), Duration::from_secs(30))
        .await
        .unwrap();

    let out = tempfile::tempdir().unwrap();
    cache
        .fetch(&artifact, &env, out.path(), Duration::from_secs(30))
        .await
        .unwrap();
    // The archive itself lands in the output dir, unexpanded.
    assert!(out.path().join("out.tgz").is_file());
    assert!(!out.path().join("weights.txt").exists());
}

#[tokio::test]
async fn storage_service_surface_is_reachable_directly() {
    use experiment_runner::infrastructure::storage::ObjectStoreBackend;

    let store_root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();

    let artifact = local_artifact(store_root.path(), "pack.tar", true);
    let backend = ObjectStoreBackend::for_artifact(&artifact, &BTreeMap::new()).unwrap();
    backend
        .deposit(src.path(), "pack.tar", Duration::from_secs(30))
        .await
        .unwrap();
    let first = backend.hash("pack.tar", Duration::from_secs(30)).await.unwrap();
    let second = backend.hash("pack.tar", Duration::from_secs(30)).await.unwrap();
    assert_eq!(first, second);
    backend.close().await.unwrap();
}
