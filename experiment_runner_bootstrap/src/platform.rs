// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Platform Abstraction Module
//!
//! Host inspection behind a trait so the disk tracker and the resource
//! ledger can be tested with a fake host.
//!
//! ## Architecture Pattern
//!
//! - **Interface**: `Platform` trait defines the contract
//! - **Implementations**: `UnixPlatform` (Linux + macOS), `WindowsPlatform`
//! - **Selection**: compile-time via `#[cfg]`, see [`create_platform`]
//!
//! The bootstrap crate sits outside the application layers and may call
//! platform APIs directly (`libc`, `winapi`); this module is the only place
//! that does.

use std::path::Path;

use thiserror::Error;

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixPlatform;

#[cfg(windows)]
pub use windows::WindowsPlatform;

/// Platform-specific errors
#[derive(Debug, Error)]
pub enum PlatformError {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Feature not supported on this platform
    #[error("Not supported on this platform: {0}")]
    NotSupported(String),

    /// Generic platform error
    #[error("Platform error: {0}")]
    Other(String),
}

/// Host inspection contract.
///
/// All methods are stateless and thread-safe; fallible ones return
/// `Result` rather than guessing.
pub trait Platform: Send + Sync {
    /// Human-readable platform name ("linux", "macos", "windows")
    fn platform_name(&self) -> &'static str;

    /// Logical CPU count available to the process (at least 1)
    fn cpu_count(&self) -> usize;

    /// Total physical memory in bytes
    fn total_memory(&self) -> Result<u64, PlatformError>;

    /// Memory currently available to new allocations, in bytes
    fn available_memory(&self) -> Result<u64, PlatformError>;

    /// Total size of the volume holding `path`, in bytes
    fn disk_total(&self, path: &Path) -> Result<u64, PlatformError>;

    /// Free space on the volume holding `path`, in bytes, as seen by an
    /// unprivileged process
    fn disk_free(&self, path: &Path) -> Result<u64, PlatformError>;

    /// Host name, used to label scrape documents for multi-host merging
    fn hostname(&self) -> String;
}

/// Creates the platform implementation for the current OS.
pub fn create_platform() -> Box<dyn Platform> {
    #[cfg(unix)]
    {
        Box::new(UnixPlatform::new())
    }
    #[cfg(windows)]
    {
        Box::new(WindowsPlatform::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_count_positive() {
        let platform = create_platform();
        assert!(platform.cpu_count() >= 1);
    }

    #[test]
    fn test_memory_queries() {
        let platform = create_platform();
        let total = platform.total_memory().unwrap();
        let available = platform.available_memory().unwrap();
        assert!(total > 0);
        assert!(available <= total);
    }

    #[test]
    fn test_disk_queries_on_tempdir() {
        let platform = create_platform();
        let dir = std::env::temp_dir();
        let total = platform.disk_total(&dir).unwrap();
        let free = platform.disk_free(&dir).unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }

    #[test]
    fn test_hostname_nonempty() {
        let platform = create_platform();
        assert!(!platform.hostname().is_empty());
    }
}
