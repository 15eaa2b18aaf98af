// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Artifact References
//!
//! An artifact is a named reference to an object-store location. Immutable
//! artifacts are staged into the run's workspace exactly once and may be
//! served from the content-addressed cache; mutable artifacts are staged in,
//! tracked while the experiment runs, and uploaded back to their writable
//! destination whenever their on-disk tree changes.
//!
//! The fully-qualified URI selects the storage backend at run time; the set
//! of schemes is closed (`s3`, `gs`, `file`) and new backends are added at
//! compile time.

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Closed set of storage backends, keyed by URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScheme {
    /// S3-compatible object store (AWS, minio, ...)
    S3,
    /// Google Cloud Storage
    Gcs,
    /// Local filesystem, for tests and air-gapped deployments
    File,
}

impl StorageScheme {
    /// Extracts the scheme from a fully-qualified artifact URI.
    pub fn from_qualified(uri: &str) -> Result<Self, RunnerError> {
        let scheme = uri
            .split_once("://")
            .map(|(s, _)| s)
            .ok_or_else(|| RunnerError::BadScheme(format!("no scheme in {:?}", uri)))?;
        match scheme {
            "s3" => Ok(StorageScheme::S3),
            "gs" => Ok(StorageScheme::Gcs),
            "file" => Ok(StorageScheme::File),
            other => Err(RunnerError::BadScheme(other.to_string())),
        }
    }
}

impl std::fmt::Display for StorageScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageScheme::S3 => "s3",
            StorageScheme::Gcs => "gs",
            StorageScheme::File => "file",
        };
        write!(f, "{}", name)
    }
}

/// A named reference to an object in external storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Bucket (or local root directory for `file://`)
    #[serde(default)]
    pub bucket: String,

    /// Object key within the bucket
    #[serde(default)]
    pub key: String,

    /// Unpack the archive into the workspace rather than copying it as-is
    #[serde(default)]
    pub unpack: bool,

    /// Mutable artifacts are uploaded back to their destination on change
    #[serde(default)]
    pub mutable: bool,

    /// Fully-qualified URI; the scheme selects the storage backend
    #[serde(default)]
    pub qualified: String,

    /// Optional relative path the artifact is staged under, instead of the
    /// role name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,

    /// Optional expected content hash, verified after fetch when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Artifact {
    /// The storage backend this artifact resolves to.
    pub fn scheme(&self) -> Result<StorageScheme, RunnerError> {
        StorageScheme::from_qualified(&self.qualified)
    }

    /// Validates the reference for use as a staged input.
    ///
    /// Every artifact needs a resolvable scheme; a mutable artifact must
    /// additionally name a writable destination (bucket and key) so stage-out
    /// has somewhere to land.
    pub fn validate(&self, role: &str) -> Result<(), RunnerError> {
        self.scheme()
            .map_err(|e| RunnerError::invalid_request(format!("artifact {:?}: {}", role, e)))?;
        if self.mutable && (self.bucket.is_empty() || self.key.is_empty()) {
            return Err(RunnerError::invalid_request(format!(
                "mutable artifact {:?} has no writable destination",
                role
            )));
        }
        Ok(())
    }
}
