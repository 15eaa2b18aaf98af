// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Resource Ledger
//!
//! In-process accounting of CPU cores, RAM, scratch disk, and GPU slots.
//! The dispatcher dry-runs every request against the ledger before the
//! queue message is leased, so work the host can never satisfy is rejected
//! without being taken off the queue.
//!
//! ## Atomicity
//!
//! `alloc` with `live=true` takes the three sub-allocator locks in a fixed
//! order (GPU, then CPU, then disk - GPUs are scarcest) and commits only
//! once all three checks pass, so there is never a partial allocation to
//! roll back and never a lock-order inversion. With `live=false` the same
//! path runs checks only; dry-runs are observationally free.
//!
//! ## Handles
//!
//! A successful live allocation yields an [`AllocationHandle`] that moves
//! into [`release`](ResourceLedger::release) by value. Double release is
//! unrepresentable: the handle is consumed.

pub mod cpu;
pub mod disk;
pub mod gpu;

use std::sync::Arc;

use experiment_runner_bootstrap::platform::Platform;
use experiment_runner_domain::{Resource, RunnerError};
use parking_lot::Mutex;

use crate::infrastructure::config::RunnerConfig;
use cpu::CpuTracker;
use disk::DiskTracker;
pub use gpu::{GpuCard, GpuCardSnapshot, GpuInventory, GpuLoan};

/// Opaque token for resources held by one request.
#[derive(Debug)]
pub struct AllocationHandle {
    gpu: Vec<GpuLoan>,
    cpus: u32,
    ram: u64,
    disk_bytes: u64,
}

impl AllocationHandle {
    /// UUIDs of every card loaned to this request, in plan order. The
    /// executor joins these into `CUDA_VISIBLE_DEVICES` (set-union
    /// semantics for multi-card spans).
    pub fn gpu_uuids(&self) -> Vec<String> {
        let mut uuids: Vec<String> = Vec::new();
        for loan in &self.gpu {
            if !uuids.contains(&loan.uuid) {
                uuids.push(loan.uuid.clone());
            }
        }
        uuids
    }

    /// Total GPU slots held.
    pub fn gpu_slots(&self) -> u32 {
        self.gpu.iter().map(|l| l.slots).sum()
    }

    pub fn has_gpu(&self) -> bool {
        !self.gpu.is_empty()
    }
}

/// Process-wide resource accounting. Initialized before the dispatch loop
/// starts; outlives every executor.
pub struct ResourceLedger {
    gpus: Mutex<GpuInventory>,
    cpu: Mutex<CpuTracker>,
    disk: Mutex<DiskTracker>,
    divisibles: Vec<u32>,
}

impl ResourceLedger {
    /// Builds the ledger from configuration, falling back to detected
    /// hardware for absent caps.
    pub fn new(config: &RunnerConfig, platform: Arc<dyn Platform>) -> Result<Self, RunnerError> {
        let cpu_max = config
            .limits
            .cpus
            .unwrap_or_else(|| platform.cpu_count() as u32);
        let ram_max = match config.limits.ram {
            Some(ram) => ram,
            None => platform
                .total_memory()
                .map_err(|e| RunnerError::InvalidLimits(e.to_string()))?,
        };

        let cards = config
            .gpus
            .iter()
            .map(|c| GpuCard {
                uuid: c.uuid.clone(),
                total_slots: c.slots,
                free_slots: c.slots,
                total_mem: c.mem,
                free_mem: c.mem,
                bound_group: String::new(),
            })
            .collect();

        Ok(Self {
            gpus: Mutex::new(GpuInventory::new(cards)),
            cpu: Mutex::new(CpuTracker::new(cpu_max, ram_max)?),
            disk: Mutex::new(DiskTracker::new(
                config.disk_device(),
                config.disk.min_free,
                platform,
            )?),
            divisibles: config.gpu_divisibles.clone(),
        })
    }

    /// Replaces the CPU/RAM caps.
    pub fn set_limits(&self, cpu_max: u32, ram_max: u64) -> Result<(), RunnerError> {
        self.cpu.lock().set_limits(cpu_max, ram_max)
    }

    /// Advertised free capacity. Informational: GPU slots are summed across
    /// cards and admission still goes through [`alloc`](Self::alloc), which
    /// honors per-card feasibility.
    pub fn free(&self) -> Result<Resource, RunnerError> {
        let (gpu_slots, gpu_mem) = self.gpus.lock().free_totals();
        let (cpus, ram) = {
            let cpu = self.cpu.lock();
            (cpu.free_cpus(), cpu.free_ram())
        };
        let hdd = self.disk.lock().free()?;
        Ok(Resource {
            cpus,
            gpus: gpu_slots,
            hdd,
            ram,
            gpu_mem,
        })
    }

    /// Reserves capacity for a request.
    ///
    /// With `live=false` this is a dry-run: checks only, state untouched.
    /// With `live=true` all three sub-allocations commit together or the
    /// call returns an error having committed nothing.
    pub fn alloc(
        &self,
        need: &Resource,
        group: &str,
        live: bool,
    ) -> Result<AllocationHandle, RunnerError> {
        // Lock order: GPU, CPU, disk. Matches scarcity; everywhere else in
        // the process takes at most one of these locks.
        let mut gpus = self.gpus.lock();
        let mut cpu = self.cpu.lock();
        let mut disk = self.disk.lock();

        let loans = gpus.plan(need.gpus, need.gpu_mem, group, &self.divisibles)?;
        cpu.check(need.cpus, need.ram)?;
        disk.check(need.hdd)?;

        if live {
            gpus.commit(&loans, group);
            cpu.commit(need.cpus, need.ram);
            disk.commit(need.hdd);
        }

        Ok(AllocationHandle {
            gpu: loans,
            cpus: need.cpus,
            ram: need.ram,
            disk_bytes: need.hdd,
        })
    }

    /// Returns every quantity the handle loaned. Consumes the handle;
    /// releasing twice does not compile.
    pub fn release(&self, handle: AllocationHandle) {
        let mut gpus = self.gpus.lock();
        let mut cpu = self.cpu.lock();
        let mut disk = self.disk.lock();
        gpus.release(&handle.gpu);
        cpu.release(handle.cpus, handle.ram);
        disk.release(handle.disk_bytes);
    }

    /// Card-level view for operators and tests.
    pub fn describe_gpus(&self) -> Vec<GpuCardSnapshot> {
        self.gpus.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::GpuCardConfig;
    use experiment_runner_bootstrap::platform::PlatformError;
    use std::path::Path;

    const GIB: u64 = 1 << 30;

    struct FakeHost;

    impl Platform for FakeHost {
        fn platform_name(&self) -> &'static str {
            "test"
        }
        fn cpu_count(&self) -> usize {
            8
        }
        fn total_memory(&self) -> Result<u64, PlatformError> {
            Ok(32 * GIB)
        }
        fn available_memory(&self) -> Result<u64, PlatformError> {
            Ok(16 * GIB)
        }
        fn disk_total(&self, _path: &Path) -> Result<u64, PlatformError> {
            Ok(100 * GIB)
        }
        fn disk_free(&self, _path: &Path) -> Result<u64, PlatformError> {
            Ok(80 * GIB)
        }
        fn hostname(&self) -> String {
            "test-host".into()
        }
    }

    fn ledger_with_cards(cards: Vec<GpuCardConfig>, divisibles: Vec<u32>) -> ResourceLedger {
        let mut config = RunnerConfig::default();
        config.gpus = cards;
        config.gpu_divisibles = divisibles;
        config.disk.min_free = Some(GIB);
        ResourceLedger::new(&config, Arc::new(FakeHost)).unwrap()
    }

    fn one_card_host() -> ResourceLedger {
        ledger_with_cards(
            vec![GpuCardConfig {
                uuid: "gpu-0".into(),
                slots: 8,
                mem: 16 * GIB,
            }],
            vec![1, 2, 4, 8, 16, 24],
        )
    }

    fn request(cpus: u32, gpus: u32, hdd: u64, ram: u64, gpu_mem: u64) -> Resource {
        Resource {
            cpus,
            gpus,
            hdd,
            ram,
            gpu_mem,
        }
    }

    // Scenario: single 8-slot/16GiB card, request fits, alloc succeeds.
    #[test]
    fn test_gpu_fit_success() {
        let ledger = one_card_host();
        let need = request(1, 1, GIB, GIB, 8 * GIB);
        let handle = ledger.alloc(&need, "demo", true).unwrap();
        assert_eq!(handle.gpu_uuids(), vec!["gpu-0".to_string()]);
        assert!(handle.has_gpu());
        ledger.release(handle);
    }

    // Scenario: same card, 32GiB of GPU memory requested, dry-run rejects.
    #[test]
    fn test_gpu_fit_reject_on_mem() {
        let ledger = one_card_host();
        let need = request(1, 1, GIB, GIB, 32 * GIB);
        let err = ledger.alloc(&need, "demo", false).unwrap_err();
        assert!(err.is_capacity());
        // Nothing was taken
        let free = ledger.free().unwrap();
        assert_eq!(free.gpus, 8);
    }

    // Scenario: four 8-slot cards, gpus=16 with divisibles {8}: two cards
    // bound, and release returns everything with bindings cleared.
    #[test]
    fn test_multi_card_span_and_release() {
        let cards = (0..4)
            .map(|i| GpuCardConfig {
                uuid: format!("gpu-{}", i),
                slots: 8,
                mem: 16 * GIB,
            })
            .collect();
        let ledger = ledger_with_cards(cards, vec![8]);

        let need = request(1, 16, GIB, GIB, 8 * GIB);
        let handle = ledger.alloc(&need, "demo", true).unwrap();
        assert_eq!(handle.gpu_uuids().len(), 2);
        assert_eq!(handle.gpu_slots(), 16);

        let bound: Vec<_> = ledger
            .describe_gpus()
            .into_iter()
            .filter(|c| c.bound_group == "demo")
            .collect();
        assert_eq!(bound.len(), 2);
        assert!(bound.iter().all(|c| c.free_slots == 0));

        ledger.release(handle);
        for card in ledger.describe_gpus() {
            assert_eq!(card.free_slots, card.total_slots);
            assert_eq!(card.bound_group, "");
        }
    }

    #[test]
    fn test_dry_run_does_not_mutate() {
        let ledger = one_card_host();
        let before = ledger.free().unwrap();
        let need = request(2, 2, GIB, GIB, 2 * GIB);
        ledger.alloc(&need, "demo", false).unwrap();
        assert_eq!(ledger.free().unwrap(), before);
    }

    #[test]
    fn test_alloc_release_balances() {
        let ledger = one_card_host();
        let before = ledger.free().unwrap();
        let need = request(2, 2, GIB, GIB, 2 * GIB);
        let handle = ledger.alloc(&need, "demo", true).unwrap();
        let during = ledger.free().unwrap();
        assert_eq!(during.cpus, before.cpus - 2);
        assert_eq!(during.gpus, before.gpus - 2);
        ledger.release(handle);
        assert_eq!(ledger.free().unwrap(), before);
    }

    #[test]
    fn test_failed_live_alloc_commits_nothing() {
        let ledger = one_card_host();
        let before = ledger.free().unwrap();
        // GPU plan passes, CPU check fails: nothing may stick
        let need = request(64, 1, GIB, GIB, GIB);
        assert!(ledger.alloc(&need, "demo", true).is_err());
        assert_eq!(ledger.free().unwrap(), before);
    }

    #[test]
    fn test_cpu_only_host_accepts_cpu_work() {
        let ledger = ledger_with_cards(Vec::new(), vec![1, 2, 4, 8]);
        let need = request(2, 0, GIB, GIB, 0);
        let handle = ledger.alloc(&need, "demo", true).unwrap();
        assert!(!handle.has_gpu());
        ledger.release(handle);
    }

    #[test]
    fn test_gpu_work_rejected_on_cpu_only_host() {
        let ledger = ledger_with_cards(Vec::new(), vec![1, 2, 4, 8]);
        let need = request(1, 1, GIB, GIB, GIB);
        assert!(ledger.alloc(&need, "demo", false).is_err());
    }
}
