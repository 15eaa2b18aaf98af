// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Scratch-disk accounting against one device path. The tracker consults
//! the live volume on every check (loans from other processes share the
//! device) and keeps a soft free-space floor: 15% of the volume unless the
//! operator configured an explicit byte floor.

use std::path::PathBuf;
use std::sync::Arc;

use experiment_runner_bootstrap::platform::Platform;
use experiment_runner_domain::{ResourceDimension, RunnerError};

/// Fraction of the volume reserved when no explicit floor is configured.
const DEFAULT_MIN_FREE_PERCENT: u64 = 15;

/// Disk loan book for one device path.
pub struct DiskTracker {
    device: PathBuf,
    min_free: u64,
    allocated: u64,
    platform: Arc<dyn Platform>,
}

impl DiskTracker {
    pub fn new(
        device: PathBuf,
        min_free_floor: Option<u64>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, RunnerError> {
        let total = platform
            .disk_total(&device)
            .map_err(|e| RunnerError::UnknownDevice(format!("{:?}: {}", device, e)))?;
        let min_free = min_free_floor.unwrap_or(total * DEFAULT_MIN_FREE_PERCENT / 100);
        Ok(Self {
            device,
            min_free,
            allocated: 0,
            platform,
        })
    }

    /// Bytes still loanable: live free space minus outstanding loans and
    /// the soft floor.
    pub fn free(&self) -> Result<u64, RunnerError> {
        let live_free = self
            .platform
            .disk_free(&self.device)
            .map_err(|e| RunnerError::UnknownDevice(format!("{:?}: {}", self.device, e)))?;
        Ok(live_free
            .saturating_sub(self.allocated)
            .saturating_sub(self.min_free))
    }

    /// Checks whether the loan would fit. Never mutates.
    pub fn check(&self, bytes: u64) -> Result<(), RunnerError> {
        let free = self.free()?;
        if bytes > free {
            return Err(RunnerError::insufficient(
                ResourceDimension::Disk,
                format!(
                    "need {} bytes on {:?}, {} free above the {}-byte floor",
                    bytes, self.device, free, self.min_free
                ),
            ));
        }
        Ok(())
    }

    pub fn commit(&mut self, bytes: u64) {
        self.allocated += bytes;
    }

    pub fn release(&mut self, bytes: u64) {
        self.allocated = self.allocated.saturating_sub(bytes);
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn device(&self) -> &PathBuf {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_runner_bootstrap::platform::PlatformError;
    use std::path::Path;

    struct FixedDisk {
        total: u64,
        free: u64,
    }

    impl Platform for FixedDisk {
        fn platform_name(&self) -> &'static str {
            "test"
        }
        fn cpu_count(&self) -> usize {
            1
        }
        fn total_memory(&self) -> Result<u64, PlatformError> {
            Ok(0)
        }
        fn available_memory(&self) -> Result<u64, PlatformError> {
            Ok(0)
        }
        fn disk_total(&self, _path: &Path) -> Result<u64, PlatformError> {
            Ok(self.total)
        }
        fn disk_free(&self, _path: &Path) -> Result<u64, PlatformError> {
            Ok(self.free)
        }
        fn hostname(&self) -> String {
            "test".into()
        }
    }

    fn tracker(total: u64, free: u64, floor: Option<u64>) -> DiskTracker {
        DiskTracker::new(
            PathBuf::from("/scratch"),
            floor,
            Arc::new(FixedDisk { total, free }),
        )
        .unwrap()
    }

    #[test]
    fn test_default_floor_is_fifteen_percent() {
        let t = tracker(1000, 1000, None);
        // 1000 free - 150 floor
        assert_eq!(t.free().unwrap(), 850);
    }

    #[test]
    fn test_explicit_floor_wins() {
        let t = tracker(1000, 1000, Some(300));
        assert_eq!(t.free().unwrap(), 700);
    }

    #[test]
    fn test_loans_reduce_free() {
        let mut t = tracker(1000, 1000, Some(100));
        t.check(500).unwrap();
        t.commit(500);
        assert_eq!(t.free().unwrap(), 400);
        let err = t.check(401).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::InsufficientCapacity {
                dimension: ResourceDimension::Disk,
                ..
            }
        ));
        t.release(500);
        assert_eq!(t.free().unwrap(), 900);
    }
}
