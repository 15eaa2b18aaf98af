// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Windows Platform Implementation
//!
//! Windows API implementation via `winapi`: `GlobalMemoryStatusEx` for
//! memory, `GetDiskFreeSpaceExW` for volume stats, `COMPUTERNAME` for the
//! host name.

use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use winapi::um::fileapi::GetDiskFreeSpaceExW;
use winapi::um::sysinfoapi::{GlobalMemoryStatusEx, MEMORYSTATUSEX};
use winapi::um::winnt::ULARGE_INTEGER;

use super::{Platform, PlatformError};

/// Windows platform implementation.
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }

    fn memory_status() -> Result<MEMORYSTATUSEX, PlatformError> {
        // SAFETY: dwLength initialized before the call as the API requires
        unsafe {
            let mut status: MEMORYSTATUSEX = std::mem::zeroed();
            status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
            if GlobalMemoryStatusEx(&mut status) == 0 {
                return Err(PlatformError::Io(std::io::Error::last_os_error()));
            }
            Ok(status)
        }
    }

    fn disk_space(path: &Path) -> Result<(u64, u64), PlatformError> {
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        // SAFETY: out-parameters written on success, wide is NUL-terminated
        unsafe {
            let mut free_to_caller: ULARGE_INTEGER = std::mem::zeroed();
            let mut total: ULARGE_INTEGER = std::mem::zeroed();
            let mut free: ULARGE_INTEGER = std::mem::zeroed();
            if GetDiskFreeSpaceExW(wide.as_ptr(), &mut free_to_caller, &mut total, &mut free) == 0
            {
                return Err(PlatformError::Io(std::io::Error::last_os_error()));
            }
            Ok((*total.QuadPart(), *free_to_caller.QuadPart()))
        }
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for WindowsPlatform {
    fn platform_name(&self) -> &'static str {
        "windows"
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn total_memory(&self) -> Result<u64, PlatformError> {
        Self::memory_status().map(|s| s.ullTotalPhys)
    }

    fn available_memory(&self) -> Result<u64, PlatformError> {
        Self::memory_status().map(|s| s.ullAvailPhys)
    }

    fn disk_total(&self, path: &Path) -> Result<u64, PlatformError> {
        Self::disk_space(path).map(|(total, _)| total)
    }

    fn disk_free(&self, path: &Path) -> Result<u64, PlatformError> {
        Self::disk_space(path).map(|(_, free)| free)
    }

    fn hostname(&self) -> String {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}
