//! Weighted voting over round candidates
//!
//! Ballots are collected concurrently from a [`BallotProvider`] (one call per
//! eligible voter) and optionally a [`Judge`], all bounded by the vote
//! deadline. [`VotingSystem::tally`] is a pure function over the collected
//! ballots:
//!
//! 1. Only the first `BEST_ANSWER` ballot per eligible voter counts, and
//!    only if it targets an existing candidate other than the voter's own
//!    group. Everything else is recorded but advisory.
//! 2. Each counted ballot carries `base * clamp(f(perf) * g(happiness))`.
//! 3. If quorum is met the heaviest candidate wins. Exact ties, and every
//!    quorum failure, fall back to the group holding the single highest
//!    performance score, then the lowest group id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::config::{CouncilConfig, QuorumRule, WeightParams};
use crate::otel;
use crate::state::{
    Ballot, BallotNote, Candidate, Councillor, CouncillorId, GroupId, GroupTally, RoundId,
    VoteEntry, VoteSession, VoteSessionStatus, VoterRef,
};

/// Error type for voting operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VotingError {
    #[error("No candidates to vote on")]
    NoCandidates,
}

/// Result type for voting operations
pub type VotingResult<T> = Result<T, VotingError>;

/// Casts one councillor's ballot. `None` abstains.
#[async_trait]
pub trait BallotProvider: Send + Sync {
    async fn cast(
        &self,
        round_id: RoundId,
        voter: &Councillor,
        candidates: &[Candidate],
    ) -> Option<Ballot>;
}

/// External reviewer whose ballots are recorded but never decide a round.
#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    async fn advise(&self, round_id: RoundId, candidates: &[Candidate]) -> Vec<Ballot>;
}

pub type SharedBallotProvider = Arc<dyn BallotProvider>;
pub type SharedJudge = Arc<dyn Judge>;

/// Outcome of one vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResult {
    pub winner: GroupId,
    /// True when the winner came from the quorum-failure fallback
    pub degraded: bool,
    pub session: VoteSession,
}

pub struct VotingSystem {
    weights: WeightParams,
    quorum: QuorumRule,
    vote_deadline: Duration,
    ballots: SharedBallotProvider,
    judge: Option<SharedJudge>,
}

impl VotingSystem {
    pub fn new(
        weights: WeightParams,
        quorum: QuorumRule,
        vote_deadline: Duration,
        ballots: SharedBallotProvider,
    ) -> Self {
        Self {
            weights,
            quorum,
            vote_deadline,
            ballots,
            judge: None,
        }
    }

    pub fn from_config(ballots: SharedBallotProvider, config: &CouncilConfig) -> Self {
        Self::new(config.weights, config.quorum, config.vote_deadline(), ballots)
    }

    pub fn with_judge(mut self, judge: SharedJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn set_judge(&mut self, judge: Option<SharedJudge>) {
        self.judge = judge;
    }

    pub fn quorum(&self) -> QuorumRule {
        self.quorum
    }

    /// `base * clamp(f(performance) * g(happiness), min, max)`
    pub fn voter_weight(&self, voter: &Councillor) -> f64 {
        let w = &self.weights;
        let raw = w.performance.eval(voter.performance_score) * w.happiness.eval(voter.happiness);
        let multiplier = if raw.is_finite() {
            raw.clamp(w.min_multiplier, w.max_multiplier)
        } else {
            w.min_multiplier
        };
        w.base * multiplier
    }

    /// Collect ballots and tally them.
    pub async fn run_vote(
        &self,
        round_id: RoundId,
        candidates: &[Candidate],
        voters: &[Councillor],
    ) -> VotingResult<VoteResult> {
        if candidates.is_empty() {
            return Err(VotingError::NoCandidates);
        }

        let span = otel::vote_span(round_id, voters.len(), candidates.len());
        let ballots = self
            .collect_ballots(round_id, candidates, voters)
            .instrument(span.clone())
            .await;

        let result = span.in_scope(|| self.tally(round_id, candidates, voters, &ballots))?;
        otel::record_vote_result(
            &span,
            result.session.participating,
            result.session.quorum_met(),
            Some(result.winner),
        );
        Ok(result)
    }

    /// Ask every voter (and the judge, if any) for ballots until the vote
    /// deadline. Councillor ballots come back in voter-id order, judge
    /// ballots after them.
    pub async fn collect_ballots(
        &self,
        round_id: RoundId,
        candidates: &[Candidate],
        voters: &[Councillor],
    ) -> Vec<Ballot> {
        let deadline = Instant::now() + self.vote_deadline;
        let candidates: Arc<[Candidate]> = candidates.iter().cloned().collect();
        let mut join_set: JoinSet<(Option<CouncillorId>, Vec<Ballot>)> = JoinSet::new();

        for voter in voters {
            let provider = self.ballots.clone();
            let candidates = candidates.clone();
            let voter = voter.clone();
            join_set.spawn(async move {
                let own = VoterRef::Councillor(voter.id);
                let ballot = provider
                    .cast(round_id, &voter, &candidates)
                    .await
                    .filter(|b| {
                        if b.voter != own {
                            warn!(
                                round_id,
                                voter = %voter.id,
                                claimed = %b.voter,
                                "Dropping ballot cast under another voter's identity"
                            );
                        }
                        b.voter == own
                    });
                (Some(voter.id), ballot.into_iter().collect())
            });
        }

        if let Some(judge) = &self.judge {
            let judge = judge.clone();
            let candidates = candidates.clone();
            join_set.spawn(async move {
                // Judge ballots are always attributed to the judge
                let name = judge.name().to_string();
                let ballots = judge
                    .advise(round_id, &candidates)
                    .await
                    .into_iter()
                    .map(|mut b| {
                        b.voter = VoterRef::Judge(name.clone());
                        b
                    })
                    .collect();
                (None, ballots)
            });
        }

        let mut from_voters: BTreeMap<CouncillorId, Vec<Ballot>> = BTreeMap::new();
        let mut from_judge: Vec<Ballot> = Vec::new();

        loop {
            match timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((Some(id), ballots)))) => {
                    from_voters.insert(id, ballots);
                }
                Ok(Some(Ok((None, ballots)))) => from_judge = ballots,
                Ok(Some(Err(e))) => warn!(round_id, error = %e, "Ballot task panicked"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        round_id,
                        outstanding = join_set.len(),
                        "Vote deadline elapsed, treating outstanding voters as abstaining"
                    );
                    join_set.abort_all();
                    break;
                }
            }
        }

        let mut ballots: Vec<Ballot> = from_voters.into_values().flatten().collect();
        ballots.extend(from_judge);
        debug!(round_id, ballots = ballots.len(), "Ballots collected");
        ballots
    }

    /// Resolve a vote from already-collected ballots.
    ///
    /// Deterministic: the same ballots, candidates and voters always produce
    /// the same session and winner, regardless of candidate order.
    pub fn tally(
        &self,
        round_id: RoundId,
        candidates: &[Candidate],
        voters: &[Councillor],
        ballots: &[Ballot],
    ) -> VotingResult<VoteResult> {
        if candidates.is_empty() {
            return Err(VotingError::NoCandidates);
        }

        let eligible: BTreeMap<CouncillorId, &Councillor> =
            voters.iter().map(|c| (c.id, c)).collect();
        let mut own_group: BTreeMap<CouncillorId, GroupId> = BTreeMap::new();
        for candidate in candidates {
            for author in &candidate.authors {
                own_group.insert(*author, candidate.group_id);
            }
        }
        let candidate_ids: BTreeSet<GroupId> = candidates.iter().map(|c| c.group_id).collect();

        let mut session = VoteSession::open(
            round_id,
            eligible.len(),
            self.quorum.required(eligible.len()),
        );
        let mut seen: BTreeSet<CouncillorId> = BTreeSet::new();
        let mut counted: Vec<(CouncillorId, GroupId, f64)> = Vec::new();

        for ballot in ballots {
            let voter = match &ballot.voter {
                VoterRef::Councillor(id) => eligible.get(id).copied(),
                VoterRef::Judge(_) => None,
            };
            let weight = voter.map(|v| self.voter_weight(v)).unwrap_or(0.0);

            let note = match (&ballot.voter, voter) {
                (VoterRef::Judge(_), _) => Some(BallotNote::Advisory),
                _ if !ballot.vote_type.is_decisive() => Some(BallotNote::Advisory),
                (_, None) => Some(BallotNote::NotEligible),
                (_, Some(v)) if !seen.insert(v.id) => Some(BallotNote::Duplicate),
                _ if !candidate_ids.contains(&ballot.target) => {
                    Some(BallotNote::UnknownCandidate)
                }
                (_, Some(v)) if own_group.get(&v.id) == Some(&ballot.target) => {
                    Some(BallotNote::OwnGroup)
                }
                _ => None,
            };

            if note.is_none() {
                if let Some(v) = voter {
                    counted.push((v.id, ballot.target, weight));
                }
            }

            session.entries.push(VoteEntry {
                voter: ballot.voter.clone(),
                vote_type: ballot.vote_type,
                target: ballot.target,
                weight,
                counted: note.is_none(),
                note,
            });
        }

        // Sum in voter-id order so float addition is order independent
        counted.sort_by_key(|(id, _, _)| *id);
        let mut totals: BTreeMap<GroupId, GroupTally> = candidate_ids
            .iter()
            .map(|&group_id| {
                (
                    group_id,
                    GroupTally {
                        group_id,
                        weight: 0.0,
                        ballots: 0,
                    },
                )
            })
            .collect();
        for (_, target, weight) in &counted {
            if let Some(tally) = totals.get_mut(target) {
                tally.weight += weight;
                tally.ballots += 1;
            }
        }

        session.participating = counted.len();
        session.tallies = totals.into_values().collect();

        let (winner, degraded) = if session.quorum_met() {
            let top = session
                .tallies
                .iter()
                .map(|t| t.weight)
                .fold(f64::NEG_INFINITY, f64::max);
            let leaders: Vec<GroupId> = session
                .tallies
                .iter()
                .filter(|t| t.weight == top)
                .map(|t| t.group_id)
                .collect();

            let winner = if leaders.len() == 1 {
                leaders[0]
            } else {
                let tied: Vec<&Candidate> = candidates
                    .iter()
                    .filter(|c| leaders.contains(&c.group_id))
                    .collect();
                debug!(round_id, tied = leaders.len(), "Weight tie, using fallback ordering");
                fallback_winner(&tied, &eligible).ok_or(VotingError::NoCandidates)?
            };
            session.status = VoteSessionStatus::Closed;
            (winner, false)
        } else {
            let all: Vec<&Candidate> = candidates.iter().collect();
            let winner = fallback_winner(&all, &eligible).ok_or(VotingError::NoCandidates)?;
            session.status = VoteSessionStatus::QuorumFailed;
            warn!(
                round_id,
                participating = session.participating,
                required = session.quorum_required,
                winner,
                "Quorum not met, resolving in degraded mode"
            );
            (winner, true)
        };

        session.winner = Some(winner);
        info!(
            round_id,
            winner,
            degraded,
            participating = session.participating,
            "Vote resolved"
        );

        Ok(VoteResult {
            winner,
            degraded,
            session,
        })
    }
}

/// The group holding the single highest performance score wins; remaining
/// ties go to the lowest group id.
fn fallback_winner(
    candidates: &[&Candidate],
    roster: &BTreeMap<CouncillorId, &Councillor>,
) -> Option<GroupId> {
    let best_score = |candidate: &Candidate| {
        candidate
            .authors
            .iter()
            .filter_map(|id| roster.get(id))
            .map(|c| c.performance_score)
            .fold(f64::NEG_INFINITY, f64::max)
    };

    candidates
        .iter()
        .map(|c| (c.group_id, best_score(*c)))
        .min_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)))
        .map(|(group_id, _)| group_id)
}
