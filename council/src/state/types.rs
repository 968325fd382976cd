//! Core types for council state
//!
//! Councillors, groups, rounds, vote sessions and graveyard records. These
//! are the values the store persists; live references between them are
//! always ids, never pointers.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic round number. Round 0 is reserved for bootstrap.
pub type RoundId = u64;

/// Dense per-round group index.
pub type GroupId = u32;

/// Stable councillor id. Issued monotonically and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CouncillorId(pub u64);

impl fmt::Display for CouncillorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Closed set of councillor specializations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialization {
    Analyst,
    Builder,
    Critic,
    Researcher,
    Strategist,
}

/// Capability descriptor for a specialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecializationProfile {
    pub tag: Specialization,
    pub title: &'static str,
    pub focus: &'static str,
    pub strengths: &'static [&'static str],
}

impl Specialization {
    /// All specializations in declaration order.
    pub const ALL: [Specialization; 5] = [
        Self::Analyst,
        Self::Builder,
        Self::Critic,
        Self::Researcher,
        Self::Strategist,
    ];

    pub fn profile(self) -> SpecializationProfile {
        match self {
            Self::Analyst => SpecializationProfile {
                tag: self,
                title: "Analyst",
                focus: "Decomposes the task and checks the reasoning",
                strengths: &["decomposition", "consistency checks", "edge cases"],
            },
            Self::Builder => SpecializationProfile {
                tag: self,
                title: "Builder",
                focus: "Produces concrete, working artifacts",
                strengths: &["implementation", "integration", "iteration speed"],
            },
            Self::Critic => SpecializationProfile {
                tag: self,
                title: "Critic",
                focus: "Finds defects and weak assumptions",
                strengths: &["review", "failure modes", "risk assessment"],
            },
            Self::Researcher => SpecializationProfile {
                tag: self,
                title: "Researcher",
                focus: "Gathers context and prior art",
                strengths: &["context gathering", "citations", "alternatives"],
            },
            Self::Strategist => SpecializationProfile {
                tag: self,
                title: "Strategist",
                focus: "Plans the approach and sequences the work",
                strengths: &["planning", "prioritization", "trade-offs"],
            },
        }
    }

    /// Position in [`Specialization::ALL`].
    pub fn index(self) -> usize {
        match self {
            Self::Analyst => 0,
            Self::Builder => 1,
            Self::Critic => 2,
            Self::Researcher => 3,
            Self::Strategist => 4,
        }
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analyst => write!(f, "analyst"),
            Self::Builder => write!(f, "builder"),
            Self::Critic => write!(f, "critic"),
            Self::Researcher => write!(f, "researcher"),
            Self::Strategist => write!(f, "strategist"),
        }
    }
}

/// Lifecycle status of a councillor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncillorStatus {
    /// Newly spawned, exempt from culling
    Probation,
    Active,
    /// Never stored on a roster entry: retired councillors leave the roster
    /// and only their [`GraveyardRecord`] remains. Reported by
    /// `PopulationManager::status_of`.
    Retired,
}

/// Scored outcome recorded in a councillor's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Win,
    Loss,
}

impl RoundOutcome {
    /// EMA target value: 1 for a win, 0 for a loss.
    pub fn value(self) -> f64 {
        match self {
            Self::Win => 1.0,
            Self::Loss => 0.0,
        }
    }
}

/// Per-member classification of a resolved round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberOutcome {
    Win,
    Loss,
    /// Held out, infra-faulted, or no winner was chosen. Not scored.
    NoContest,
}

impl MemberOutcome {
    pub fn scored(self) -> Option<RoundOutcome> {
        match self {
            Self::Win => Some(RoundOutcome::Win),
            Self::Loss => Some(RoundOutcome::Loss),
            Self::NoContest => None,
        }
    }
}

/// One entry in a councillor's outcome history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub round_id: RoundId,
    pub outcome: RoundOutcome,
}

/// Bounded ring buffer of the most recent scored outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl OutcomeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest once full.
    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn wins(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == RoundOutcome::Win)
            .count()
    }

    /// Fraction of recorded rounds won, `None` when empty.
    pub fn win_rate(&self) -> Option<f64> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.wins() as f64 / self.entries.len() as f64)
        }
    }
}

/// A competitive participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Councillor {
    pub id: CouncillorId,
    pub specialization: Specialization,
    /// EMA of round outcomes
    pub performance_score: f64,
    /// Always within [0, 100]
    pub happiness: f64,
    pub win_streak: u32,
    pub loss_streak: u32,
    pub status: CouncillorStatus,
    pub created_round: RoundId,
    pub history: OutcomeHistory,
}

impl Councillor {
    pub fn new(
        id: CouncillorId,
        specialization: Specialization,
        created_round: RoundId,
        performance_score: f64,
        happiness: f64,
        history_len: usize,
    ) -> Self {
        Self {
            id,
            specialization,
            performance_score,
            happiness: happiness.clamp(0.0, 100.0),
            win_streak: 0,
            loss_streak: 0,
            status: CouncillorStatus::Probation,
            created_round,
            history: OutcomeHistory::new(history_len),
        }
    }

    pub fn is_probationary(&self) -> bool {
        self.status == CouncillorStatus::Probation
    }

    /// Rounds elapsed since spawn as of `round`.
    pub fn rounds_served(&self, round: RoundId) -> u64 {
        round.saturating_sub(self.created_round)
    }
}

/// A unit of work every group attempts in a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a task with a caller-chosen id (useful for replay).
    pub fn with_id(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            created_at: Utc::now(),
        }
    }

    /// First 100 characters of the prompt, for logs and records.
    pub fn preview(&self) -> String {
        if self.prompt.chars().count() > 100 {
            let head: String = self.prompt.chars().take(100).collect();
            format!("{}...", head)
        } else {
            self.prompt.clone()
        }
    }
}

/// Round-scoped team that produces one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub round_id: RoundId,
    pub members: Vec<CouncillorId>,
    pub specializations: Vec<Specialization>,
}

impl Group {
    pub fn contains(&self, id: CouncillorId) -> bool {
        self.members.contains(&id)
    }
}

/// What a task executor hands back for a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub content: String,
    /// Executor's self-reported confidence, 0.0–1.0. Informational only.
    pub confidence: f64,
}

impl Submission {
    pub fn new(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence,
        }
    }
}

/// A submission attributed to the group that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub group_id: GroupId,
    pub authors: Vec<CouncillorId>,
    pub content: String,
    pub confidence: f64,
}

/// Who is at fault when a group produced nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The group itself failed; counts as a loss for its members.
    AgentFault,
    /// The environment failed; excluded from scoring.
    InfraFault,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentFault => write!(f, "agent_fault"),
            Self::InfraFault => write!(f, "infra_fault"),
        }
    }
}

/// A group's failure to produce a candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GroupFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl GroupFailure {
    pub fn agent_fault(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::AgentFault,
            message: message.into(),
        }
    }

    pub fn infra_fault(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::InfraFault,
            message: message.into(),
        }
    }

    pub fn is_infra(&self) -> bool {
        self.kind == FailureKind::InfraFault
    }
}

/// Candidate-or-failure for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupOutcome {
    Candidate(Candidate),
    Failed(GroupFailure),
}

/// What happened to a group during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub group: Group,
    pub outcome: GroupOutcome,
    /// Executor calls made, including infra retries
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl GroupReport {
    pub fn candidate(&self) -> Option<&Candidate> {
        match &self.outcome {
            GroupOutcome::Candidate(c) => Some(c),
            GroupOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&GroupFailure> {
        match &self.outcome {
            GroupOutcome::Failed(f) => Some(f),
            GroupOutcome::Candidate(_) => None,
        }
    }
}

/// Status of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Partitioning,
    Executing,
    Collecting,
    Voting,
    Resolved,
    /// Resolved through the degraded fallback
    QuorumFailed,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Partitioning => write!(f, "partitioning"),
            Self::Executing => write!(f, "executing"),
            Self::Collecting => write!(f, "collecting"),
            Self::Voting => write!(f, "voting"),
            Self::Resolved => write!(f, "resolved"),
            Self::QuorumFailed => write!(f, "quorum_failed"),
        }
    }
}

/// Persisted record of a resolved round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_id: RoundId,
    pub task_id: String,
    pub task_preview: String,
    /// Sorted by group id
    pub groups: Vec<GroupReport>,
    pub held_out: Vec<CouncillorId>,
    pub winning_group: Option<GroupId>,
    pub status: RoundStatus,
    /// Sorted by councillor id
    pub member_outcomes: Vec<(CouncillorId, MemberOutcome)>,
    pub started_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

impl RoundRecord {
    pub fn outcome_for(&self, id: CouncillorId) -> Option<MemberOutcome> {
        self.member_outcomes
            .binary_search_by_key(&id, |(cid, _)| *cid)
            .ok()
            .map(|idx| self.member_outcomes[idx].1)
    }

    pub fn winning_candidate(&self) -> Option<&Candidate> {
        let winner = self.winning_group?;
        self.groups
            .iter()
            .find(|r| r.group.id == winner)
            .and_then(GroupReport::candidate)
    }
}

/// Kind of ballot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteType {
    Analysis,
    Assignment,
    Review,
    /// The only type that decides a round
    BestAnswer,
}

impl VoteType {
    pub fn is_decisive(self) -> bool {
        self == Self::BestAnswer
    }
}

/// Who cast a ballot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum VoterRef {
    Councillor(CouncillorId),
    /// External judge or critic; always advisory
    Judge(String),
}

impl fmt::Display for VoterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Councillor(id) => write!(f, "{}", id),
            Self::Judge(name) => write!(f, "judge:{}", name),
        }
    }
}

/// A single vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub voter: VoterRef,
    pub vote_type: VoteType,
    pub target: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Ballot {
    pub fn best_answer(voter: CouncillorId, target: GroupId) -> Self {
        Self {
            voter: VoterRef::Councillor(voter),
            vote_type: VoteType::BestAnswer,
            target,
            rationale: None,
        }
    }

    pub fn advisory(voter: VoterRef, vote_type: VoteType, target: GroupId) -> Self {
        Self {
            voter,
            vote_type,
            target,
            rationale: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// Why a ballot did not count toward the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BallotNote {
    /// Non-decisive vote type or a judge ballot
    Advisory,
    NotEligible,
    Duplicate,
    UnknownCandidate,
    OwnGroup,
}

/// Recorded ballot with its computed weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteEntry {
    pub voter: VoterRef,
    pub vote_type: VoteType,
    pub target: GroupId,
    pub weight: f64,
    /// Whether this ballot contributed to the tally
    pub counted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<BallotNote>,
}

/// Weighted total for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTally {
    pub group_id: GroupId,
    pub weight: f64,
    pub ballots: u32,
}

/// Status of a vote session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteSessionStatus {
    Open,
    Closed,
    QuorumFailed,
}

/// Full record of one round's vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteSession {
    pub round_id: RoundId,
    pub entries: Vec<VoteEntry>,
    pub eligible_voters: usize,
    pub quorum_required: usize,
    pub participating: usize,
    /// Sorted by group id
    pub tallies: Vec<GroupTally>,
    pub status: VoteSessionStatus,
    pub winner: Option<GroupId>,
}

impl VoteSession {
    pub fn open(round_id: RoundId, eligible_voters: usize, quorum_required: usize) -> Self {
        Self {
            round_id,
            entries: Vec::new(),
            eligible_voters,
            quorum_required,
            participating: 0,
            tallies: Vec::new(),
            status: VoteSessionStatus::Open,
            winner: None,
        }
    }

    pub fn quorum_met(&self) -> bool {
        self.participating >= self.quorum_required
    }

    pub fn tally_for(&self, group_id: GroupId) -> Option<&GroupTally> {
        self.tallies.iter().find(|t| t.group_id == group_id)
    }
}

/// Why a councillor left the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetirementReason {
    /// Bottom of the ranking in a culling cycle
    Culled { rank: usize },
    /// Retired by an operator
    Manual { note: String },
}

impl RetirementReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Culled { .. } => "culled",
            Self::Manual { .. } => "manual",
        }
    }
}

impl fmt::Display for RetirementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Culled { rank } => write!(f, "culled (rank {})", rank),
            Self::Manual { note } => write!(f, "manual: {}", note),
        }
    }
}

/// Append-only retirement entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraveyardRecord {
    pub id: CouncillorId,
    pub specialization: Specialization,
    pub created_round: RoundId,
    pub retirement_round: RoundId,
    pub lifetime_rounds: u64,
    pub final_performance_score: f64,
    pub final_happiness: f64,
    pub reason: RetirementReason,
    pub retired_at: DateTime<Utc>,
}

impl GraveyardRecord {
    pub fn from_councillor(
        councillor: &Councillor,
        retirement_round: RoundId,
        reason: RetirementReason,
    ) -> Self {
        Self {
            id: councillor.id,
            specialization: councillor.specialization,
            created_round: councillor.created_round,
            retirement_round,
            lifetime_rounds: councillor.rounds_served(retirement_round),
            final_performance_score: councillor.performance_score,
            final_happiness: councillor.happiness,
            reason,
            retired_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_ring_evicts_oldest() {
        let mut history = OutcomeHistory::new(3);
        for round_id in 1..=5 {
            history.push(HistoryEntry {
                round_id,
                outcome: if round_id % 2 == 0 {
                    RoundOutcome::Win
                } else {
                    RoundOutcome::Loss
                },
            });
        }

        assert_eq!(history.len(), 3);
        let rounds: Vec<RoundId> = history.iter().map(|e| e.round_id).collect();
        assert_eq!(rounds, vec![3, 4, 5]);
        assert_eq!(history.wins(), 1);
        assert_eq!(history.last().map(|e| e.round_id), Some(5));
    }

    #[test]
    fn test_new_councillor_is_probationary_and_clamped() {
        let c = Councillor::new(CouncillorId(7), Specialization::Critic, 4, 0.5, 140.0, 10);
        assert!(c.is_probationary());
        assert_eq!(c.happiness, 100.0);
        assert_eq!(c.rounds_served(10), 6);
        assert_eq!(c.rounds_served(2), 0);
    }

    #[test]
    fn test_specialization_profiles_match_tags() {
        for (idx, spec) in Specialization::ALL.iter().enumerate() {
            assert_eq!(spec.profile().tag, *spec);
            assert_eq!(spec.index(), idx);
            assert!(!spec.profile().strengths.is_empty());
        }
    }

    #[test]
    fn test_graveyard_record_lifetime() {
        let c = Councillor::new(CouncillorId(1), Specialization::Analyst, 3, 0.2, 40.0, 10);
        let record = GraveyardRecord::from_councillor(&c, 10, RetirementReason::Culled { rank: 0 });
        assert_eq!(record.lifetime_rounds, 7);
        assert_eq!(record.final_performance_score, 0.2);
        assert_eq!(record.reason.label(), "culled");
    }

    #[test]
    fn test_round_record_outcome_lookup() {
        let now = Utc::now();
        let record = RoundRecord {
            round_id: 1,
            task_id: "t".into(),
            task_preview: "t".into(),
            groups: Vec::new(),
            held_out: Vec::new(),
            winning_group: None,
            status: RoundStatus::Resolved,
            member_outcomes: vec![
                (CouncillorId(1), MemberOutcome::Win),
                (CouncillorId(4), MemberOutcome::NoContest),
            ],
            started_at: now,
            resolved_at: now,
        };
        assert_eq!(record.outcome_for(CouncillorId(4)), Some(MemberOutcome::NoContest));
        assert_eq!(record.outcome_for(CouncillorId(2)), None);
    }

    #[test]
    fn test_vote_type_serde_names() {
        let json = serde_json::to_string(&VoteType::BestAnswer).unwrap();
        assert_eq!(json, "\"BEST_ANSWER\"");
        assert!(VoteType::BestAnswer.is_decisive());
        assert!(!VoteType::Review.is_decisive());
    }
}
