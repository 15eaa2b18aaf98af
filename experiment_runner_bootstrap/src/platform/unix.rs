// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Unix Platform Implementation
//!
//! POSIX implementation for Linux and macOS.
//!
//! ## Platform APIs Used
//!
//! - **Memory**: `/proc/meminfo` on Linux, `sysctlbyname` on macOS
//! - **Disk**: `libc::statvfs` (free space as `f_bavail`, the unprivileged
//!   view, not `f_bfree`)
//! - **Hostname**: `libc::gethostname`

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::{Platform, PlatformError};

/// Unix (POSIX) platform implementation.
pub struct UnixPlatform;

impl UnixPlatform {
    pub fn new() -> Self {
        Self
    }

    #[cfg(target_os = "linux")]
    fn memory_info() -> Result<(u64, u64), PlatformError> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")
            .map_err(|e| PlatformError::Other(format!("failed to read /proc/meminfo: {}", e)))?;

        let mut total = None;
        let mut available = None;
        for line in meminfo.lines() {
            let parse_kb = |value: &str| {
                value
                    .trim()
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
            };
            if let Some(value) = line.strip_prefix("MemTotal:") {
                total = parse_kb(value);
            } else if let Some(value) = line.strip_prefix("MemAvailable:") {
                available = parse_kb(value);
            }
            if total.is_some() && available.is_some() {
                break;
            }
        }

        match (total, available) {
            (Some(t), Some(a)) => Ok((t, a)),
            _ => Err(PlatformError::Other("failed to parse /proc/meminfo".into())),
        }
    }

    #[cfg(target_os = "macos")]
    fn memory_info() -> Result<(u64, u64), PlatformError> {
        let mut total: u64 = 0;
        let mut size = std::mem::size_of::<u64>();
        let name = b"hw.memsize\0".as_ptr() as *const libc::c_char;

        // SAFETY: out-parameters sized for a u64 as hw.memsize documents
        let rc = unsafe {
            libc::sysctlbyname(
                name,
                &mut total as *mut _ as *mut libc::c_void,
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc != 0 {
            return Err(PlatformError::Other("sysctl hw.memsize failed".into()));
        }
        // Available memory has no cheap portable query on macOS; half of
        // total is the established approximation for soft limits.
        Ok((total, total / 2))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn memory_info() -> Result<(u64, u64), PlatformError> {
        Err(PlatformError::NotSupported("memory query".into()))
    }

    fn statvfs(path: &Path) -> Result<libc::statvfs, PlatformError> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| PlatformError::Other(format!("path {:?} contains NUL", path)))?;
        // SAFETY: stat is an out-parameter fully written on success
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(cpath.as_ptr(), &mut stat) != 0 {
                return Err(PlatformError::Io(std::io::Error::last_os_error()));
            }
            Ok(stat)
        }
    }
}

impl Default for UnixPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for UnixPlatform {
    fn platform_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "linux"
        }
        #[cfg(target_os = "macos")]
        {
            "macos"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            "unix"
        }
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn total_memory(&self) -> Result<u64, PlatformError> {
        Self::memory_info().map(|(total, _)| total)
    }

    fn available_memory(&self) -> Result<u64, PlatformError> {
        Self::memory_info().map(|(_, available)| available)
    }

    fn disk_total(&self, path: &Path) -> Result<u64, PlatformError> {
        let stat = Self::statvfs(path)?;
        Ok(stat.f_blocks as u64 * stat.f_frsize as u64)
    }

    fn disk_free(&self, path: &Path) -> Result<u64, PlatformError> {
        let stat = Self::statvfs(path)?;
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    fn hostname(&self) -> String {
        let mut buf = [0u8; 256];
        // SAFETY: buffer length passed alongside the pointer
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        "localhost".to_string()
    }
}
