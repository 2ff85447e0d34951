// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process lifecycle states and the allowed transitions between them.
//!
//! ```text
//! CREATED -> RUNNING <-> WAITING
//!               |          |
//!               v          v
//!   FINISHED | KILLED | EXCEPTED   (terminal)
//! ```
//!
//! PAUSED is not a state of its own: it is an overlay flag on any
//! non-terminal state, tracked by the process control handle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Record exists, no step has run yet.
    Created,
    /// A step is executing.
    Running,
    /// Suspended on an awaitable.
    Waiting,
    /// Completed, possibly with a non-zero exit status.
    Finished,
    /// Killed on request.
    Killed,
    /// Failed with an error.
    Excepted,
}

impl ProcessState {
    /// Stable string form written to the process record.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Created => "created",
            ProcessState::Running => "running",
            ProcessState::Waiting => "waiting",
            ProcessState::Finished => "finished",
            ProcessState::Killed => "killed",
            ProcessState::Excepted => "excepted",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Finished | ProcessState::Killed | ProcessState::Excepted
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (Created, Running) | (Created, Killed) | (Created, Excepted) => true,
            (Running, Waiting) | (Running, Finished) | (Running, Killed) | (Running, Excepted) => {
                true
            }
            (Waiting, Running) | (Waiting, Killed) | (Waiting, Excepted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ProcessState::Created),
            "running" => Ok(ProcessState::Running),
            "waiting" => Ok(ProcessState::Waiting),
            "finished" => Ok(ProcessState::Finished),
            "killed" => Ok(ProcessState::Killed),
            "excepted" => Ok(ProcessState::Excepted),
            other => Err(format!("unknown process state '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ProcessState::*;

    const ALL: [ProcessState; 6] = [Created, Running, Waiting, Finished, Killed, Excepted];

    #[test]
    fn test_terminal_states() {
        assert!(!Created.is_terminal());
        assert!(!Running.is_terminal());
        assert!(!Waiting.is_terminal());
        assert!(Finished.is_terminal());
        assert!(Killed.is_terminal());
        assert!(Excepted.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
        assert!(Waiting.can_transition_to(Killed));
        assert!(Created.can_transition_to(Excepted));

        assert!(!Created.can_transition_to(Waiting));
        assert!(!Created.can_transition_to(Finished));
        assert!(!Waiting.can_transition_to(Finished));
        assert!(!Running.can_transition_to(Created));
    }

    #[test]
    fn test_every_non_terminal_state_can_be_killed() {
        for state in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(Killed));
            assert!(state.can_transition_to(Excepted));
        }
    }

    #[test]
    fn test_string_round_trip() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<ProcessState>().unwrap(), state);
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.to_string())
            );
        }
        assert!("paused".parse::<ProcessState>().is_err());
    }

    proptest! {
        /// Applying only allowed moves from CREATED never returns to CREATED
        /// and stops at the first terminal state.
        #[test]
        fn prop_allowed_walks_are_monotonic(moves in proptest::collection::vec(0..ALL.len(), 0..40)) {
            let mut state = Created;
            for index in moves {
                let next = ALL[index];
                if !state.can_transition_to(next) {
                    continue;
                }
                prop_assert_ne!(next, Created);
                prop_assert!(!state.is_terminal());
                state = next;
            }
            if state.is_terminal() {
                prop_assert!(ALL.iter().all(|to| !state.can_transition_to(*to)));
            }
        }
    }
}
