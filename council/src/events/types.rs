//! Council lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{
    CouncillorId, FailureKind, GroupId, RetirementReason, RoundId, Specialization,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    RoundStarted {
        round_id: RoundId,
        task_id: String,
        groups: usize,
        held_out: usize,
        timestamp: DateTime<Utc>,
    },

    GroupCompleted {
        round_id: RoundId,
        group_id: GroupId,
        attempts: u32,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    GroupFailed {
        round_id: RoundId,
        group_id: GroupId,
        kind: FailureKind,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Emitted after the round is committed
    VoteResolved {
        round_id: RoundId,
        winner: Option<GroupId>,
        degraded: bool,
        participating: usize,
        quorum_required: usize,
        timestamp: DateTime<Utc>,
    },

    CouncillorRetired {
        round_id: RoundId,
        councillor_id: CouncillorId,
        lifetime_rounds: u64,
        reason: RetirementReason,
        timestamp: DateTime<Utc>,
    },

    CouncillorSpawned {
        round_id: RoundId,
        councillor_id: CouncillorId,
        specialization: Specialization,
        timestamp: DateTime<Utc>,
    },

    CullingCompleted {
        round_id: RoundId,
        fired: usize,
        spawned: usize,
        timestamp: DateTime<Utc>,
    },

    /// A store commit failed and nothing was applied
    CommitFailed {
        round_id: RoundId,
        stage: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl CouncilEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CouncilEvent::RoundStarted { timestamp, .. } => *timestamp,
            CouncilEvent::GroupCompleted { timestamp, .. } => *timestamp,
            CouncilEvent::GroupFailed { timestamp, .. } => *timestamp,
            CouncilEvent::VoteResolved { timestamp, .. } => *timestamp,
            CouncilEvent::CouncillorRetired { timestamp, .. } => *timestamp,
            CouncilEvent::CouncillorSpawned { timestamp, .. } => *timestamp,
            CouncilEvent::CullingCompleted { timestamp, .. } => *timestamp,
            CouncilEvent::CommitFailed { timestamp, .. } => *timestamp,
        }
    }

    pub fn round_id(&self) -> RoundId {
        match self {
            CouncilEvent::RoundStarted { round_id, .. }
            | CouncilEvent::GroupCompleted { round_id, .. }
            | CouncilEvent::GroupFailed { round_id, .. }
            | CouncilEvent::VoteResolved { round_id, .. }
            | CouncilEvent::CouncillorRetired { round_id, .. }
            | CouncilEvent::CouncillorSpawned { round_id, .. }
            | CouncilEvent::CullingCompleted { round_id, .. }
            | CouncilEvent::CommitFailed { round_id, .. } => *round_id,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CouncilEvent::RoundStarted { .. } => "round_started",
            CouncilEvent::GroupCompleted { .. } => "group_completed",
            CouncilEvent::GroupFailed { .. } => "group_failed",
            CouncilEvent::VoteResolved { .. } => "vote_resolved",
            CouncilEvent::CouncillorRetired { .. } => "councillor_retired",
            CouncilEvent::CouncillorSpawned { .. } => "councillor_spawned",
            CouncilEvent::CullingCompleted { .. } => "culling_completed",
            CouncilEvent::CommitFailed { .. } => "commit_failed",
        }
    }
}
