//! Round state machine: explicit phases and legal transition guards.
//!
//! Every phase change in [`crate::Council`] goes through
//! [`RoundStateMachine::advance`], which rejects edges outside the graph
//! below and records the rest in a transition log.
//!
//! ```text
//! Idle → Partitioning → Executing → Collecting → Voting → Resolved
//! Resolved → Idle | Culling
//! Idle → Culling                  (retrying a culling whose commit failed)
//! Culling → Spawning → Idle
//! any non-Idle phase → Idle       (abort: nothing applied)
//! ```

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::state::RoundId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncilPhase {
    /// Between rounds.
    Idle,
    Partitioning,
    /// Groups running concurrently.
    Executing,
    Collecting,
    Voting,
    /// Round committed and applied.
    Resolved,
    /// Selecting and retiring the worst performers.
    Culling,
    /// Spawning replacements.
    Spawning,
}

impl fmt::Display for CouncilPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Partitioning => write!(f, "Partitioning"),
            Self::Executing => write!(f, "Executing"),
            Self::Collecting => write!(f, "Collecting"),
            Self::Voting => write!(f, "Voting"),
            Self::Resolved => write!(f, "Resolved"),
            Self::Culling => write!(f, "Culling"),
            Self::Spawning => write!(f, "Spawning"),
        }
    }
}

fn is_legal_transition(from: CouncilPhase, to: CouncilPhase) -> bool {
    use CouncilPhase::*;

    if to == Idle && from != Idle {
        return true;
    }

    matches!(
        (from, to),
        (Idle, Partitioning)
            | (Partitioning, Executing)
            | (Executing, Collecting)
            | (Collecting, Voting)
            | (Voting, Resolved)
            // Rounds where every group failed skip the vote
            | (Collecting, Resolved)
            | (Resolved, Culling)
            | (Idle, Culling)
            | (Culling, Spawning)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: CouncilPhase,
    pub to: CouncilPhase,
    pub round_id: RoundId,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal phase transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: CouncilPhase,
    pub to: CouncilPhase,
}

/// Log cap; older records are dropped first.
const MAX_TRANSITIONS: usize = 1024;

pub struct RoundStateMachine {
    current: CouncilPhase,
    round_id: RoundId,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl RoundStateMachine {
    pub fn new() -> Self {
        Self {
            current: CouncilPhase::Idle,
            round_id: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> CouncilPhase {
        self.current
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    /// Enter `Partitioning` for a new round.
    pub fn begin_round(&mut self, round_id: RoundId) -> Result<(), IllegalTransition> {
        if self.current != CouncilPhase::Idle {
            return Err(IllegalTransition {
                from: self.current,
                to: CouncilPhase::Partitioning,
            });
        }
        self.round_id = round_id;
        self.advance(CouncilPhase::Partitioning, None)
    }

    pub fn advance(
        &mut self,
        to: CouncilPhase,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(
            from = %self.current,
            to = %to,
            round_id = self.round_id,
            "Phase transition"
        );

        if self.transitions.len() == MAX_TRANSITIONS {
            self.transitions.remove(0);
        }
        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            round_id: self.round_id,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Return to `Idle` without applying anything. No-op when already idle.
    pub fn abort(&mut self, reason: &str) {
        if self.current != CouncilPhase::Idle {
            // Always legal from a non-idle phase
            let _ = self.advance(CouncilPhase::Idle, Some(reason));
        }
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn summary(&self) -> String {
        let phases: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut summary = format!(
            "round {} at {} ({}ms, {} transitions)",
            self.round_id,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !phases.is_empty() {
            summary.push_str(&format!(" [{}]", phases.join(" → ")));
        }
        summary
    }
}

impl Default for RoundStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_round(sm: &mut RoundStateMachine, round_id: RoundId) {
        sm.begin_round(round_id).unwrap();
        sm.advance(CouncilPhase::Executing, None).unwrap();
        sm.advance(CouncilPhase::Collecting, None).unwrap();
        sm.advance(CouncilPhase::Voting, None).unwrap();
        sm.advance(CouncilPhase::Resolved, None).unwrap();
    }

    #[test]
    fn test_happy_path_with_culling() {
        let mut sm = RoundStateMachine::new();
        resolve_round(&mut sm, 10);
        sm.advance(CouncilPhase::Culling, Some("cull_every reached"))
            .unwrap();
        sm.advance(CouncilPhase::Spawning, None).unwrap();
        sm.advance(CouncilPhase::Idle, None).unwrap();

        assert_eq!(sm.current(), CouncilPhase::Idle);
        assert_eq!(sm.transitions().len(), 8);
        assert!(sm.transitions().iter().all(|t| t.round_id == 10));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut sm = RoundStateMachine::new();
        let err = sm.advance(CouncilPhase::Voting, None).unwrap_err();
        assert_eq!(err.from, CouncilPhase::Idle);
        assert_eq!(err.to, CouncilPhase::Voting);

        sm.begin_round(1).unwrap();
        assert!(sm.begin_round(2).is_err());
        assert!(sm.advance(CouncilPhase::Spawning, None).is_err());
        assert!(sm.advance(CouncilPhase::Idle, None).is_ok());
        assert!(sm.advance(CouncilPhase::Idle, None).is_err());
    }

    #[test]
    fn test_abort_returns_to_idle() {
        let mut sm = RoundStateMachine::new();
        sm.begin_round(3).unwrap();
        sm.advance(CouncilPhase::Executing, None).unwrap();
        sm.abort("commit failed");
        assert_eq!(sm.current(), CouncilPhase::Idle);
        assert_eq!(
            sm.transitions().last().and_then(|t| t.reason.as_deref()),
            Some("commit failed")
        );

        // Idle abort is a no-op
        let before = sm.transitions().len();
        sm.abort("again");
        assert_eq!(sm.transitions().len(), before);
    }

    #[test]
    fn test_culling_retry_from_idle() {
        let mut sm = RoundStateMachine::new();
        assert!(sm.advance(CouncilPhase::Culling, Some("retry")).is_ok());
        assert!(sm.advance(CouncilPhase::Spawning, None).is_ok());
        assert!(sm.summary().contains("Culling → Spawning"));
    }
}
