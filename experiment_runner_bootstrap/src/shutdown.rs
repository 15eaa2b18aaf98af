// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Drain Coordination
//!
//! Graceful wind-down for a queue worker. A drain request stops new-work
//! pickup without aborting in-flight experiments; the coordinator tracks
//! in-flight tasks and lets the caller wait for them, bounded by a grace
//! period after which the cancellation token fires and child processes are
//! signalled.
//!
//! ## Shape
//!
//! - **Cancellation token** (`tokio_util`) propagated from the dispatch
//!   loop through the executor to the child process
//! - **Drain kind** records whether the worker should exit or merely idle
//!   once drained
//! - **Task guards** are RAII handles; dropping one decrements the
//!   in-flight count and wakes drain waiters

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default grace period before in-flight work is hard-cancelled (seconds)
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;

const DRAIN_NONE: u8 = 0;
const DRAIN_TERMINATE: u8 = 1;
const DRAIN_SUSPEND: u8 = 2;

/// What the worker should do once it has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainKind {
    /// Finish in-flight work, then exit the process
    Terminate,
    /// Finish in-flight work, then idle until told otherwise
    Suspend,
}

/// RAII marker for one in-flight task.
///
/// Created by [`DrainCoordinator::begin_task`]; dropping it marks the task
/// finished and wakes anyone waiting in [`DrainCoordinator::wait_idle`].
pub struct TaskGuard {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Coordinates drain requests, in-flight accounting, and hard cancellation.
#[derive(Clone)]
pub struct DrainCoordinator {
    cancel: CancellationToken,
    drain: Arc<AtomicU8>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    grace_period: Duration,
}

impl DrainCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            drain: Arc::new(AtomicU8::new(DRAIN_NONE)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            grace_period,
        }
    }

    /// Token cancelled only when the grace period lapses (or
    /// [`force_cancel`](Self::force_cancel) is called). Executors select on
    /// this to kill child processes.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Records a drain request. The first request wins; a later `Terminate`
    /// upgrades an earlier `Suspend` but never the reverse.
    pub fn request_drain(&self, kind: DrainKind) {
        let value = match kind {
            DrainKind::Terminate => DRAIN_TERMINATE,
            DrainKind::Suspend => DRAIN_SUSPEND,
        };
        let previous = self.drain.load(Ordering::SeqCst);
        if previous == DRAIN_NONE || (previous == DRAIN_SUSPEND && value == DRAIN_TERMINATE) {
            self.drain.store(value, Ordering::SeqCst);
            tracing::info!(kind = ?kind, "drain requested");
        }
    }

    /// Clears a `Suspend` drain so a resumed worker can pick up work again.
    /// A `Terminate` drain is sticky.
    pub fn resume(&self) {
        let _ = self.drain.compare_exchange(
            DRAIN_SUSPEND,
            DRAIN_NONE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// The outstanding drain request, if any.
    pub fn drain_kind(&self) -> Option<DrainKind> {
        match self.drain.load(Ordering::SeqCst) {
            DRAIN_TERMINATE => Some(DrainKind::Terminate),
            DRAIN_SUSPEND => Some(DrainKind::Suspend),
            _ => None,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.drain_kind().is_some()
    }

    /// Registers one in-flight task.
    pub fn begin_task(&self) -> TaskGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            in_flight: self.in_flight.clone(),
            idle: self.idle.clone(),
        }
    }

    /// Number of tasks currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until no task is in flight, bounded by the grace period.
    ///
    /// Returns `true` when the worker drained cleanly; `false` when the
    /// grace period lapsed, in which case the cancellation token has been
    /// fired and callers should expect in-flight work to abort.
    pub async fn wait_idle(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.grace_period;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        in_flight = self.in_flight(),
                        "drain grace period lapsed, cancelling in-flight work"
                    );
                    self.cancel.cancel();
                    return false;
                }
            }
        }
    }

    /// Fires the cancellation token immediately.
    pub fn force_cancel(&self) {
        self.cancel.cancel();
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_drain_initially() {
        let c = DrainCoordinator::default();
        assert!(!c.is_draining());
        assert_eq!(c.drain_kind(), None);
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn test_terminate_upgrades_suspend() {
        let c = DrainCoordinator::default();
        c.request_drain(DrainKind::Suspend);
        assert_eq!(c.drain_kind(), Some(DrainKind::Suspend));
        c.request_drain(DrainKind::Terminate);
        assert_eq!(c.drain_kind(), Some(DrainKind::Terminate));
        // No downgrade
        c.request_drain(DrainKind::Suspend);
        assert_eq!(c.drain_kind(), Some(DrainKind::Terminate));
    }

    #[test]
    fn test_resume_clears_only_suspend() {
        let c = DrainCoordinator::default();
        c.request_drain(DrainKind::Suspend);
        c.resume();
        assert_eq!(c.drain_kind(), None);

        c.request_drain(DrainKind::Terminate);
        c.resume();
        assert_eq!(c.drain_kind(), Some(DrainKind::Terminate));
    }

    #[test]
    fn test_task_guard_counts() {
        let c = DrainCoordinator::default();
        let g1 = c.begin_task();
        let g2 = c.begin_task();
        assert_eq!(c.in_flight(), 2);
        drop(g1);
        assert_eq!(c.in_flight(), 1);
        drop(g2);
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_tasks_finish() {
        let c = DrainCoordinator::new(Duration::from_secs(5));
        let guard = c.begin_task();
        let waiter = c.clone();
        let handle = tokio::spawn(async move { waiter.wait_idle().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        assert!(handle.await.unwrap());
        assert!(!c.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_idle_cancels_on_grace_lapse() {
        let c = DrainCoordinator::new(Duration::from_millis(50));
        let _guard = c.begin_task();
        assert!(!c.wait_idle().await);
        assert!(c.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_idle_immediate_when_idle() {
        let c = DrainCoordinator::new(Duration::from_millis(10));
        assert!(c.wait_idle().await);
    }
}
