// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Storage Adapter
//!
//! One [`StorageService`] implementation per URI scheme, all backed by
//! `object_store` clients so no wire protocol is hand-rolled. The variant
//! is picked from the artifact's fully-qualified URI; credentials come
//! exclusively from the request's env mapping, never from the worker's own
//! process environment.
//!
//! ## Fetch shape
//!
//! Objects are spooled to a local file first (the cache's `.partial`
//! marker when a tap is supplied, a temp file otherwise), then extracted
//! from the spool. The spool is byte-for-byte the compressed object, which
//! is exactly what the cache wants to keep.
//!
//! ## S3 specifics
//!
//! Static key/secret from the request env; the region is taken from
//! `AWS_REGION`/`AWS_DEFAULT_REGION` or extracted from
//! `s3-<region>.amazonaws.com`-style endpoints; a missing region is a
//! bad-request, not a retryable fault. Non-AWS endpoints (minio and
//! friends) pass through as endpoint overrides.

pub mod archive;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use experiment_runner_domain::{Artifact, RunnerError, StorageScheme, StorageService};
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;

/// Env keys credentials are read from, per the request-isolation contract.
const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
const ENV_SECRET_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const ENV_REGION: &str = "AWS_REGION";
const ENV_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
const ENV_ENDPOINT: &str = "AWS_ENDPOINT";
const ENV_GOOGLE_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Extracts a region from `s3-<region>.amazonaws.com` and
/// `s3.<region>.amazonaws.com` endpoint forms.
pub fn region_from_endpoint(endpoint: &str) -> Option<String> {
    let host = endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next()?;
    let rest = host.strip_suffix(".amazonaws.com")?;
    let region = rest.strip_prefix("s3-").or_else(|| rest.strip_prefix("s3."))?;
    if region.is_empty() {
        None
    } else {
        Some(region.to_string())
    }
}

fn map_store_err(err: object_store::Error) -> RunnerError {
    match err {
        object_store::Error::NotFound { path, .. } => RunnerError::NotFound(path),
        other => {
            let text = other.to_string();
            if text.contains("403")
                || text.contains("401")
                || text.to_ascii_lowercase().contains("credential")
                || text.to_ascii_lowercase().contains("forbidden")
            {
                RunnerError::Auth(text)
            } else {
                RunnerError::Network(text)
            }
        }
    }
}

/// Scheme-dispatched storage backend.
#[derive(Debug)]
pub struct ObjectStoreBackend {
    scheme: StorageScheme,
    bucket: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Builds the backend an artifact resolves to, authenticated from the
    /// request's env mapping.
    pub fn for_artifact(
        artifact: &Artifact,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, RunnerError> {
        let scheme = artifact.scheme()?;
        let store: Arc<dyn ObjectStore> = match scheme {
            StorageScheme::S3 => Arc::new(Self::build_s3(&artifact.bucket, env)?),
            StorageScheme::Gcs => Arc::new(Self::build_gcs(&artifact.bucket, env)?),
            StorageScheme::File => Arc::new(Self::build_local(&artifact.bucket)?),
        };
        Ok(Self {
            scheme,
            bucket: artifact.bucket.clone(),
            store,
        })
    }

    fn build_s3(
        bucket: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<object_store::aws::AmazonS3, RunnerError> {
        let access_key = env
            .get(ENV_ACCESS_KEY)
            .ok_or_else(|| RunnerError::Auth(format!("{} missing from request env", ENV_ACCESS_KEY)))?;
        let secret_key = env
            .get(ENV_SECRET_KEY)
            .ok_or_else(|| RunnerError::Auth(format!("{} missing from request env", ENV_SECRET_KEY)))?;

        let endpoint = env.get(ENV_ENDPOINT);
        let region = env
            .get(ENV_REGION)
            .or_else(|| env.get(ENV_DEFAULT_REGION))
            .cloned()
            .or_else(|| endpoint.and_then(|e| region_from_endpoint(e)));

        let mut builder = object_store::aws::AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);

        match endpoint {
            Some(endpoint) if region_from_endpoint(endpoint).is_none() => {
                // Non-AWS S3-compatible endpoint
                builder = builder
                    .with_endpoint(endpoint.clone())
                    .with_allow_http(endpoint.starts_with("http://"));
                builder = builder.with_region(region.unwrap_or_else(|| "us-east-1".to_string()));
            }
            _ => {
                let region = region.ok_or_else(|| {
                    RunnerError::invalid_request(
                        "no region in request env and none derivable from the endpoint",
                    )
                })?;
                builder = builder.with_region(region);
            }
        }

        builder.build().map_err(map_store_err)
    }

    fn build_gcs(
        bucket: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<object_store::gcp::GoogleCloudStorage, RunnerError> {
        let mut builder =
            object_store::gcp::GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
        if let Some(credentials) = env.get(ENV_GOOGLE_CREDENTIALS) {
            builder = builder.with_service_account_path(credentials);
        }
        builder.build().map_err(map_store_err)
    }

    fn build_local(root: &str) -> Result<object_store::local::LocalFileSystem, RunnerError> {
        std::fs::create_dir_all(root)?;
        object_store::local::LocalFileSystem::new_with_prefix(root).map_err(map_store_err)
    }

    /// The scheme this backend was built for.
    pub fn scheme(&self) -> StorageScheme {
        self.scheme
    }

    /// Streams the object into `spool`.
    async fn download(
        &self,
        name: &str,
        spool: &Path,
        timeout: Duration,
    ) -> Result<(), RunnerError> {
        let path = ObjectPath::from(name);
        let fetch = async {
            let result = self.store.get(&path).await.map_err(map_store_err)?;
            let mut stream = result.into_stream();
            if let Some(parent) = spool.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(spool).await?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(map_store_err)?;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<(), RunnerError>(())
        };
        tokio::time::timeout(timeout, fetch)
            .await
            .map_err(|_| RunnerError::timeout(format!("fetching {}/{}", self.bucket, name)))?
    }
}

#[async_trait]
impl StorageService for ObjectStoreBackend {
    async fn hash(&self, name: &str, timeout: Duration) -> Result<String, RunnerError> {
        let path = ObjectPath::from(name);
        let head = tokio::time::timeout(timeout, self.store.head(&path))
            .await
            .map_err(|_| RunnerError::timeout(format!("head {}/{}", self.bucket, name)))?
            .map_err(map_store_err)?;
        // The platform tag is opaque; when the store offers none, a
        // size/mtime composite still gives a usable equality key.
        Ok(head.e_tag.unwrap_or_else(|| {
            format!("{}-{}", head.size, head.last_modified.timestamp())
        }))
    }

    async fn fetch(
        &self,
        name: &str,
        unpack: bool,
        output_dir: &Path,
        tap: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Vec<String>, RunnerError> {
        // Spool first: the tap wants the raw compressed bytes anyway.
        let temp_holder = match &tap {
            Some(_) => None,
            None => Some(
                tempfile::NamedTempFile::new()
                    .map_err(|e| RunnerError::io_error(format!("spool: {}", e)))?,
            ),
        };
        let spool: PathBuf = match &tap {
            Some(path) => path.clone(),
            None => temp_holder
                .as_ref()
                .map(|t| t.path().to_path_buf())
                .unwrap_or_default(),
        };

        self.download(name, &spool, timeout).await?;

        let name_owned = name.to_string();
        let out_dir = output_dir.to_path_buf();
        let spool_for_extract = spool.clone();
        let warnings = tokio::task::spawn_blocking(move || {
            if unpack {
                archive::unpack_archive(&spool_for_extract, &name_owned, &out_dir)
            } else {
                archive::place_file(&spool_for_extract, &name_owned, &out_dir).map(|_| Vec::new())
            }
        })
        .await
        .map_err(|e| RunnerError::internal(format!("extraction task: {}", e)))??;

        Ok(warnings)
    }

    async fn deposit(
        &self,
        src_dir: &Path,
        dest: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, RunnerError> {
        // Archive into a spool, then stream the spool through a multipart
        // upload. Deposits never pass through the cache.
        let spool = tempfile::NamedTempFile::new()
            .map_err(|e| RunnerError::io_error(format!("spool: {}", e)))?;
        let spool_path = spool.path().to_path_buf();

        let src = src_dir.to_path_buf();
        let dest_owned = dest.to_string();
        let build_spool = spool_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&build_spool)
                .map_err(|e| RunnerError::io_error(e.to_string()))?;
            archive::build_archive(&src, &dest_owned, file)
        })
        .await
        .map_err(|e| RunnerError::internal(format!("archive task: {}", e)))??;

        let path = ObjectPath::from(dest);
        let upload = async {
            let (_id, mut writer) = self
                .store
                .put_multipart(&path)
                .await
                .map_err(map_store_err)?;
            let mut file = tokio::fs::File::open(&spool_path).await?;
            tokio::io::copy(&mut file, &mut writer).await?;
            writer.shutdown().await?;
            Ok::<(), RunnerError>(())
        };
        tokio::time::timeout(timeout, upload)
            .await
            .map_err(|_| RunnerError::timeout(format!("deposit {}/{}", self.bucket, dest)))??;

        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(qualified: &str, bucket: &str, key: &str) -> Artifact {
        Artifact {
            bucket: bucket.to_string(),
            key: key.to_string(),
            qualified: qualified.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_region_extraction() {
        assert_eq!(
            region_from_endpoint("https://s3-us-west-2.amazonaws.com"),
            Some("us-west-2".to_string())
        );
        assert_eq!(
            region_from_endpoint("https://s3.eu-central-1.amazonaws.com/bucket"),
            Some("eu-central-1".to_string())
        );
        assert_eq!(region_from_endpoint("http://minio.local:9000"), None);
        assert_eq!(region_from_endpoint("https://s3.amazonaws.com"), None);
    }

    #[test]
    fn test_s3_without_credentials_is_auth_error() {
        let art = artifact("s3://bkt/ws.tgz", "bkt", "ws.tgz");
        let err = ObjectStoreBackend::for_artifact(&art, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, RunnerError::Auth(_)));
    }

    #[test]
    fn test_s3_without_region_is_bad_request() {
        let art = artifact("s3://bkt/ws.tgz", "bkt", "ws.tgz");
        let mut env = BTreeMap::new();
        env.insert(ENV_ACCESS_KEY.to_string(), "AK".to_string());
        env.insert(ENV_SECRET_KEY.to_string(), "SK".to_string());
        let err = ObjectStoreBackend::for_artifact(&art, &env).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidRequest(_)));
    }

    #[test]
    fn test_s3_region_from_endpoint_accepted() {
        let art = artifact("s3://bkt/ws.tgz", "bkt", "ws.tgz");
        let mut env = BTreeMap::new();
        env.insert(ENV_ACCESS_KEY.to_string(), "AK".to_string());
        env.insert(ENV_SECRET_KEY.to_string(), "SK".to_string());
        env.insert(
            ENV_ENDPOINT.to_string(),
            "https://s3-us-west-2.amazonaws.com".to_string(),
        );
        assert!(ObjectStoreBackend::for_artifact(&art, &env).is_ok());
    }

    #[tokio::test]
    async fn test_local_round_trip_through_service() {
        let store_root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("metric.txt"), b"loss=0.01").unwrap();

        let art = artifact(
            "file:///unused",
            store_root.path().to_str().unwrap(),
            "runs/out.tgz",
        );
        let backend = ObjectStoreBackend::for_artifact(&art, &BTreeMap::new()).unwrap();

        backend
            .deposit(src.path(), "runs/out.tgz", Duration::from_secs(10))
            .await
            .unwrap();

        let hash = backend
            .hash("runs/out.tgz", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!hash.is_empty());

        let out = tempfile::tempdir().unwrap();
        let warnings = backend
            .fetch("runs/out.tgz", true, out.path(), None, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(
            std::fs::read(out.path().join("metric.txt")).unwrap(),
            b"loss=0.01"
        );
    }

    #[tokio::test]
    async fn test_fetch_missing_object_is_not_found() {
        let store_root = tempfile::tempdir().unwrap();
        let art = artifact(
            "file:///unused",
            store_root.path().to_str().unwrap(),
            "missing.tgz",
        );
        let backend = ObjectStoreBackend::for_artifact(&art, &BTreeMap::new()).unwrap();
        let out = tempfile::tempdir().unwrap();
        let err = backend
            .fetch("missing.tgz", true, out.path(), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_tap_captures_raw_blob() {
        let store_root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"payload").unwrap();

        let art = artifact(
            "file:///unused",
            store_root.path().to_str().unwrap(),
            "blob.tgz",
        );
        let backend = ObjectStoreBackend::for_artifact(&art, &BTreeMap::new()).unwrap();
        backend
            .deposit(src.path(), "blob.tgz", Duration::from_secs(10))
            .await
            .unwrap();

        let tap_dir = tempfile::tempdir().unwrap();
        let tap_path = tap_dir.path().join("captured");
        let out = tempfile::tempdir().unwrap();
        backend
            .fetch(
                "blob.tgz",
                true,
                out.path(),
                Some(tap_path.clone()),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        // The tap holds the object byte-for-byte
        let stored = std::fs::read(store_root.path().join("blob.tgz")).unwrap();
        let tapped = std::fs::read(&tap_path).unwrap();
        assert_eq!(stored, tapped);
        assert!(out.path().join("a.txt").exists());
    }
}
