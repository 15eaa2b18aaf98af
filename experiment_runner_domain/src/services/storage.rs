// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Storage Port
//!
//! The uniform fetch/deposit/hash contract over object stores. The artifact
//! cache is the primary caller; the executor never touches storage directly.
//!
//! ## Contract notes
//!
//! - `hash` returns the platform's own content tag (ETag, generation, ...).
//!   The engine never reinterprets it; it is an opaque equality key.
//! - `fetch` with `unpack=true` walks the archive into `output_dir`, guarded
//!   against member paths that escape it. With `unpack=false` the object is
//!   written into `output_dir` as a single file.
//! - `tap`, when present, receives a byte-for-byte copy of the compressed
//!   stream concurrently with extraction. The cache passes its `.partial`
//!   marker path here to capture the raw blob.
//! - Warnings (non-fatal degradations, e.g. a stale cache fallback) are
//!   returned as strings alongside success; errors abort the operation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RunnerError;

/// Uniform object-store access: one implementation per URI scheme.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Returns the platform content hash for the named object.
    async fn hash(&self, name: &str, timeout: Duration) -> Result<String, RunnerError>;

    /// Downloads the named object into `output_dir`, optionally unpacking
    /// archives, optionally tapping the raw stream into `tap`.
    async fn fetch(
        &self,
        name: &str,
        unpack: bool,
        output_dir: &Path,
        tap: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Vec<String>, RunnerError>;

    /// Archives `src_dir` and streams it to the named destination object.
    /// The destination suffix must name a tar-family archive.
    async fn deposit(
        &self,
        src_dir: &Path,
        dest: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, RunnerError>;

    /// Releases any client handles. Idempotent.
    async fn close(&self) -> Result<(), RunnerError>;
}
