// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Resource Requirements
//!
//! The resource tuple a request declares and the scheduler matches against
//! local hardware: CPU cores, RAM, disk, GPU slots, and GPU memory.
//!
//! ## The `fits` partial order
//!
//! Scheduling decisions are made with [`Resource::fits`], the field-wise `<=`
//! comparison. `fits` is reflexive and transitive but deliberately not
//! additive: `a fits c` and `b fits c` says nothing about whether `a + b`
//! fits `c`. The ledger therefore never sums requests; it re-checks each
//! allocation against its own live accounting.
//!
//! ## GPU slots
//!
//! GPUs are scheduled in a card-abstracted *slot* unit so heterogeneous
//! fleets divide uniformly: a consumer card counts 2 slots, mid-tier cards
//! 4-8, top-tier cards 16-24. A request asking for `gpus: 16` may span
//! several cards; the per-card split policy lives in the ledger, not here.
//!
//! ## Wire format
//!
//! Byte-denominated fields arrive from the queue payload either as raw
//! integers or as humanized strings (`"10gb"`, `"512mb"`). Both forms
//! deserialize into plain `u64` byte counts; serialization always emits
//! integers so the canonical form of a request is stable.

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Parses a humanized byte quantity (`"2gb"`, `"512 MiB"`, `"1024"`).
pub fn parse_bytes(text: &str) -> Result<u64, RunnerError> {
    byte_unit::Byte::parse_str(text, true)
        .map(|b| b.as_u64())
        .map_err(|e| RunnerError::invalid_request(format!("bad byte quantity {:?}: {}", text, e)))
}

/// Serde adapter for fields that accept `"10gb"`-style strings or integers.
pub(crate) mod byte_size {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Count(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(n),
            Raw::Text(t) => super::parse_bytes(&t).map_err(serde::de::Error::custom),
        }
    }
}

/// Resource requirements of one request, and equally the free capacity the
/// ledger advertises. Field-wise comparable via [`Resource::fits`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// CPU core count
    #[serde(default)]
    pub cpus: u32,

    /// GPU slot count (card-abstracted unit)
    #[serde(default)]
    pub gpus: u32,

    /// Disk bytes required under the runner's scratch device
    #[serde(default, with = "byte_size")]
    pub hdd: u64,

    /// RAM bytes
    #[serde(default, with = "byte_size")]
    pub ram: u64,

    /// GPU memory bytes, per request (not per card)
    #[serde(default, rename = "gpuMem", with = "byte_size")]
    pub gpu_mem: u64,
}

impl Resource {
    /// Returns true when `self` fits inside `other`, field-wise.
    ///
    /// This is the scheduler's only comparison: a request fits a host when
    /// every dimension of the request is at most the host's free capacity.
    pub fn fits(&self, other: &Resource) -> bool {
        self.cpus <= other.cpus
            && self.gpus <= other.gpus
            && self.hdd <= other.hdd
            && self.ram <= other.ram
            && self.gpu_mem <= other.gpu_mem
    }

    /// True when no dimension requests anything
    pub fn is_zero(&self) -> bool {
        *self == Resource::default()
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpus={} ram={} hdd={} gpus={} gpuMem={}",
            self.cpus, self.ram, self.hdd, self.gpus, self.gpu_mem
        )
    }
}
