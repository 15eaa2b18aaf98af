// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Lifecycle State
//!
//! Process-wide run state driven by an operator-maintained key/value source
//! and by OS signals. Transitions gate new-work pickup without aborting
//! in-flight tasks: a draining worker finishes what it holds, then either
//! sleeps (`DrainAndSuspend`) or exits (`DrainAndTerminate`).

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Operator-visible run states of the worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Normal operation: poll queues, lease work
    #[default]
    Running,
    /// Finish in-flight work, then exit the process
    DrainAndTerminate,
    /// Finish in-flight work, then idle until the state changes again
    DrainAndSuspend,
}

impl LifecycleState {
    /// True when the dispatcher may lease new work
    pub fn accepts_work(&self) -> bool {
        matches!(self, LifecycleState::Running)
    }

    /// True when an idle worker should exit rather than sleep
    pub fn wants_exit(&self) -> bool {
        matches!(self, LifecycleState::DrainAndTerminate)
    }
}

impl FromStr for LifecycleState {
    type Err = RunnerError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim() {
            "Running" => Ok(LifecycleState::Running),
            "DrainAndTerminate" => Ok(LifecycleState::DrainAndTerminate),
            "DrainAndSuspend" => Ok(LifecycleState::DrainAndSuspend),
            other => Err(RunnerError::invalid_config(format!(
                "unknown lifecycle state {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Running => "Running",
            LifecycleState::DrainAndTerminate => "DrainAndTerminate",
            LifecycleState::DrainAndSuspend => "DrainAndSuspend",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for state in [
            LifecycleState::Running,
            LifecycleState::DrainAndTerminate,
            LifecycleState::DrainAndSuspend,
        ] {
            assert_eq!(state.to_string().parse::<LifecycleState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_state_is_config_error() {
        assert!("Paused".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn test_gating() {
        assert!(LifecycleState::Running.accepts_work());
        assert!(!LifecycleState::DrainAndSuspend.accepts_work());
        assert!(!LifecycleState::DrainAndTerminate.accepts_work());
        assert!(LifecycleState::DrainAndTerminate.wants_exit());
        assert!(!LifecycleState::DrainAndSuspend.wants_exit());
    }
}
