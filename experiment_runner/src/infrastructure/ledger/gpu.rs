// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # GPU Inventory
//!
//! Slot-denominated accounting over the host's cards. Cards are iterated
//! in a stable order (inventory insertion order) so planning is
//! deterministic.
//!
//! ## Group affinity
//!
//! A card loaning slots to a request becomes *bound* to the request's
//! group. Later requests from the same group prefer their bound cards;
//! cards bound to a different group are off limits. The binding is sticky:
//! it clears only when the card returns to fully free, so sequential
//! requests from one project keep landing on warm cards.
//!
//! ## Multi-card spans
//!
//! When a request needs more slots than any single card offers, the plan
//! spans cards in per-card pieces whose sizes must come from the
//! configured allow-list of slot divisions. A request that cannot be cut
//! into allowed pieces fails even when the raw slot total would suffice.
//! Memory is interpreted per participating card: every card in the span
//! must have the request's `gpu_mem` free.

use experiment_runner_domain::{ResourceDimension, RunnerError};
use serde::Serialize;

/// One card's books.
#[derive(Debug, Clone)]
pub struct GpuCard {
    pub uuid: String,
    pub total_slots: u32,
    pub free_slots: u32,
    pub total_mem: u64,
    pub free_mem: u64,
    pub bound_group: String,
}

/// Slots and memory loaned from one card for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuLoan {
    pub uuid: String,
    pub slots: u32,
    pub mem: u64,
}

/// Read-only card view for operators and tests.
#[derive(Debug, Clone, Serialize)]
pub struct GpuCardSnapshot {
    pub uuid: String,
    pub total_slots: u32,
    pub free_slots: u32,
    pub total_mem: u64,
    pub free_mem: u64,
    pub bound_group: String,
}

/// The host's card set.
#[derive(Debug, Default)]
pub struct GpuInventory {
    cards: Vec<GpuCard>,
}

impl GpuInventory {
    pub fn new(cards: Vec<GpuCard>) -> Self {
        Self { cards }
    }

    /// Plans loans for `need_slots` slots with `need_mem` bytes free on
    /// every participating card. Pure: the books are untouched. An empty
    /// `group` (pre-parse dry-runs) treats every card as eligible.
    pub fn plan(
        &self,
        need_slots: u32,
        need_mem: u64,
        group: &str,
        divisibles: &[u32],
    ) -> Result<Vec<GpuLoan>, RunnerError> {
        if need_slots == 0 {
            return Ok(Vec::new());
        }

        let eligible = |card: &GpuCard| {
            group.is_empty() || card.bound_group.is_empty() || card.bound_group == group
        };

        // Group-bound cards first, then fresh cards, stable within each pass.
        let ordered: Vec<&GpuCard> = self
            .cards
            .iter()
            .filter(|c| !group.is_empty() && c.bound_group == group)
            .chain(
                self.cards
                    .iter()
                    .filter(|c| (group.is_empty() || c.bound_group != group) && eligible(c)),
            )
            .collect();

        // Single-card fast path: the whole request on one card, no
        // division constraint.
        for card in &ordered {
            if card.free_slots >= need_slots && card.free_mem >= need_mem {
                return Ok(vec![GpuLoan {
                    uuid: card.uuid.clone(),
                    slots: need_slots,
                    mem: need_mem,
                }]);
            }
        }

        // Multi-card span in allow-listed pieces.
        let mut divisions: Vec<u32> = divisibles.to_vec();
        divisions.sort_unstable();
        divisions.dedup();

        let mut loans = Vec::new();
        let mut remaining = need_slots;
        let mut slots_seen: u32 = 0;
        for card in &ordered {
            slots_seen = slots_seen.saturating_add(card.free_slots);
            if remaining == 0 {
                break;
            }
            if card.free_mem < need_mem {
                continue;
            }
            let cap = card.free_slots.min(remaining);
            let piece = divisions.iter().rev().find(|&&d| d <= cap).copied();
            if let Some(piece) = piece {
                loans.push(GpuLoan {
                    uuid: card.uuid.clone(),
                    slots: piece,
                    mem: need_mem,
                });
                remaining -= piece;
            }
        }

        if remaining > 0 {
            let dimension = if slots_seen < need_slots {
                ResourceDimension::GpuSlots
            } else {
                ResourceDimension::GpuMem
            };
            return Err(RunnerError::insufficient(
                dimension,
                format!(
                    "need {} slots with {} bytes per card, {} slots plannable",
                    need_slots,
                    need_mem,
                    need_slots - remaining
                ),
            ));
        }
        Ok(loans)
    }

    /// Applies a plan to the books and binds the touched cards to `group`.
    pub fn commit(&mut self, loans: &[GpuLoan], group: &str) {
        for loan in loans {
            if let Some(card) = self.cards.iter_mut().find(|c| c.uuid == loan.uuid) {
                card.free_slots = card.free_slots.saturating_sub(loan.slots);
                card.free_mem = card.free_mem.saturating_sub(loan.mem);
                if !group.is_empty() {
                    card.bound_group = group.to_string();
                }
            }
        }
    }

    /// Returns loans to the books. A card's group binding clears only once
    /// the card is fully free again; partial releases keep the binding so
    /// the project's next request still prefers this card.
    pub fn release(&mut self, loans: &[GpuLoan]) {
        for loan in loans {
            if let Some(card) = self.cards.iter_mut().find(|c| c.uuid == loan.uuid) {
                card.free_slots = (card.free_slots + loan.slots).min(card.total_slots);
                card.free_mem = (card.free_mem + loan.mem).min(card.total_mem);
                if card.free_slots == card.total_slots && card.free_mem == card.total_mem {
                    card.bound_group.clear();
                }
            }
        }
    }

    /// Free slots summed across cards, and the largest single-card free
    /// memory. Informational; real admission goes through [`plan`](Self::plan).
    pub fn free_totals(&self) -> (u32, u64) {
        let slots = self.cards.iter().map(|c| c.free_slots).sum();
        let mem = self.cards.iter().map(|c| c.free_mem).max().unwrap_or(0);
        (slots, mem)
    }

    pub fn snapshot(&self) -> Vec<GpuCardSnapshot> {
        self.cards
            .iter()
            .map(|c| GpuCardSnapshot {
                uuid: c.uuid.clone(),
                total_slots: c.total_slots,
                free_slots: c.free_slots,
                total_mem: c.total_mem,
                free_mem: c.free_mem,
                bound_group: c.bound_group.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    fn card(uuid: &str, slots: u32, mem: u64) -> GpuCard {
        GpuCard {
            uuid: uuid.to_string(),
            total_slots: slots,
            free_slots: slots,
            total_mem: mem,
            free_mem: mem,
            bound_group: String::new(),
        }
    }

    #[test]
    fn test_zero_need_plans_empty() {
        let inv = GpuInventory::new(vec![card("gpu-0", 8, 16 * GIB)]);
        assert!(inv.plan(0, 0, "p", &[1, 2, 4, 8]).unwrap().is_empty());
    }

    #[test]
    fn test_single_card_fit() {
        let inv = GpuInventory::new(vec![card("gpu-0", 8, 16 * GIB)]);
        let loans = inv.plan(1, 8 * GIB, "p", &[1, 2, 4, 8]).unwrap();
        assert_eq!(loans.len(), 1);
        assert_eq!(loans[0].uuid, "gpu-0");
        assert_eq!(loans[0].slots, 1);
    }

    #[test]
    fn test_mem_overcommit_rejected_as_gpu_mem() {
        let inv = GpuInventory::new(vec![card("gpu-0", 8, 16 * GIB)]);
        let err = inv.plan(1, 32 * GIB, "p", &[1, 2, 4, 8]).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::InsufficientCapacity {
                dimension: ResourceDimension::GpuMem,
                ..
            }
        ));
    }

    #[test]
    fn test_slot_shortage_rejected_as_gpu_slots() {
        let inv = GpuInventory::new(vec![card("gpu-0", 8, 16 * GIB)]);
        let err = inv.plan(16, GIB, "p", &[1, 2, 4, 8, 16]).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::InsufficientCapacity {
                dimension: ResourceDimension::GpuSlots,
                ..
            }
        ));
    }

    #[test]
    fn test_multi_card_span_uses_allowed_pieces() {
        let inv = GpuInventory::new(vec![
            card("gpu-0", 8, 16 * GIB),
            card("gpu-1", 8, 16 * GIB),
            card("gpu-2", 8, 16 * GIB),
            card("gpu-3", 8, 16 * GIB),
        ]);
        let loans = inv.plan(16, 8 * GIB, "p", &[8]).unwrap();
        assert_eq!(loans.len(), 2);
        assert!(loans.iter().all(|l| l.slots == 8));
    }

    #[test]
    fn test_span_fails_without_allowed_division() {
        // Two 4-slot cards, pieces of 4 only: need=6 takes one full card,
        // the trailing 2 slots cannot be cut into an allowed piece.
        let inv = GpuInventory::new(vec![card("gpu-0", 4, GIB), card("gpu-1", 4, GIB)]);
        let err = inv.plan(6, GIB, "p", &[4]).unwrap_err();
        assert!(err.is_capacity());
    }

    #[test]
    fn test_group_affinity_prefers_bound_card() {
        let mut inv = GpuInventory::new(vec![card("gpu-0", 8, 16 * GIB), card("gpu-1", 8, 16 * GIB)]);
        // First request binds gpu-0 to "alpha"
        let loans = inv.plan(2, GIB, "alpha", &[1, 2, 4, 8]).unwrap();
        inv.commit(&loans, "alpha");
        assert_eq!(inv.snapshot()[0].bound_group, "alpha");

        // Second alpha request lands on the same card despite gpu-1 being freer
        let loans = inv.plan(2, GIB, "alpha", &[1, 2, 4, 8]).unwrap();
        assert_eq!(loans[0].uuid, "gpu-0");

        // A different group cannot touch the bound card
        let loans = inv.plan(2, GIB, "beta", &[1, 2, 4, 8]).unwrap();
        assert_eq!(loans[0].uuid, "gpu-1");
    }

    #[test]
    fn test_release_clears_binding_only_when_fully_free() {
        let mut inv = GpuInventory::new(vec![card("gpu-0", 8, 16 * GIB)]);
        let first = inv.plan(2, GIB, "alpha", &[1, 2, 4, 8]).unwrap();
        inv.commit(&first, "alpha");
        let second = inv.plan(2, GIB, "alpha", &[1, 2, 4, 8]).unwrap();
        inv.commit(&second, "alpha");

        inv.release(&first);
        // Still partially loaned: binding is sticky
        assert_eq!(inv.snapshot()[0].bound_group, "alpha");

        inv.release(&second);
        let snap = &inv.snapshot()[0];
        assert_eq!(snap.bound_group, "");
        assert_eq!(snap.free_slots, snap.total_slots);
        assert_eq!(snap.free_mem, snap.total_mem);
    }

    #[test]
    fn test_empty_group_sees_all_cards() {
        let mut inv = GpuInventory::new(vec![card("gpu-0", 8, 16 * GIB)]);
        let loans = inv.plan(2, GIB, "alpha", &[1, 2, 4, 8]).unwrap();
        inv.commit(&loans, "alpha");
        // Hint-based dry-run with no group still sees the bound card
        assert!(inv.plan(2, GIB, "", &[1, 2, 4, 8]).is_ok());
    }
}
