//! Council orchestrator
//!
//! A [`Council`] owns one population, drives the per-round state machine
//! and is the only writer of council state. A round runs as:
//!
//! 1. snapshot the roster and dispatch groups ([`RoundExecutor`])
//! 2. vote on the candidates that came back ([`VotingSystem`])
//! 3. classify every councillor's outcome and apply the tracker to a
//!    staged copy of the population
//! 4. commit the round to the store, then swap the staged copy in
//! 5. every `cull_every` rounds, cull and respawn, committed the same way
//!
//! If a commit fails nothing is applied: the round id is not consumed and
//! the next `run_round` re-runs the same round.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

use crate::config::{ConfigError, CouncilConfig};
use crate::events::{CouncilEvent, EventBus, SharedEventBus};
use crate::executor::{RoundExecution, RoundExecutor, SharedTaskExecutor};
use crate::otel;
use crate::population::{
    CullingReport, PopulationError, PopulationManager, PopulationSettings,
};
use crate::population::factory::policy_from_kind;
use crate::state::{
    Candidate, CouncillorId, GroupId, GroupOutcome, MemberOutcome, PopulationCommit,
    RetirementReason, RoundCommit, RoundId, RoundRecord, RoundStatus, SharedCouncilStore,
    StoreError, Task, VoteSession,
};
use crate::state_machine::{CouncilPhase, IllegalTransition, RoundStateMachine};
use crate::tracker::{PerformanceTracker, TrackerSummary};
use crate::voting::{SharedBallotProvider, SharedJudge, VoteResult, VotingError, VotingSystem};

/// Error type for council operations
#[derive(Debug, thiserror::Error)]
pub enum CouncilError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to commit round {round_id}: {source}")]
    Commit {
        round_id: RoundId,
        #[source]
        source: StoreError,
    },

    #[error("Failed to commit culling for round {round_id}: {source}")]
    CullingCommit {
        round_id: RoundId,
        #[source]
        source: StoreError,
    },

    #[error("Population error: {0}")]
    Population(#[from] PopulationError),

    #[error("Voting error: {0}")]
    Voting(#[from] VotingError),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

/// Result type for council operations
pub type CouncilResult<T> = Result<T, CouncilError>;

/// What one call to [`Council::run_round`] produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_id: RoundId,
    pub winner: Option<GroupId>,
    pub winning_candidate: Option<Candidate>,
    pub degraded: bool,
    pub status: RoundStatus,
    pub record: RoundRecord,
    pub vote: Option<VoteSession>,
    pub tracker: TrackerSummary,
    /// Set when this round triggered a culling that committed
    pub culling: Option<CullingReport>,
    /// Set when this round's culling failed to commit and will be retried
    pub culling_pending: bool,
}

/// Wires a [`Council`] to its collaborators.
pub struct CouncilBuilder {
    config: CouncilConfig,
    store: SharedCouncilStore,
    executor: SharedTaskExecutor,
    ballots: SharedBallotProvider,
    judge: Option<SharedJudge>,
    events: Option<SharedEventBus>,
}

impl CouncilBuilder {
    pub fn judge(mut self, judge: SharedJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn event_bus(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the config, then restore from the store or bootstrap a
    /// fresh population.
    pub fn open(self) -> CouncilResult<Council> {
        self.config.validate()?;
        let config = self.config;

        let settings = PopulationSettings::from_config(&config);
        let policy = policy_from_kind(config.specialization_policy);

        let councillors = self.store.list_councillors()?;
        let graveyard = self.store.graveyard()?;
        let latest = self.store.latest_round_id()?.unwrap_or(0);

        let mut population = if councillors.is_empty() && graveyard.is_empty() {
            PopulationManager::new(settings, policy)
        } else {
            PopulationManager::restore(settings, policy, councillors, graveyard)?
        };

        let spawned = population.bootstrap(latest)?;
        if !spawned.is_empty() {
            self.store.commit_population(&PopulationCommit {
                round_id: latest,
                retired: Vec::new(),
                spawned,
            })?;
        }

        // A culling round whose population commit never landed. Manual
        // retirements and bootstrap spawns at the same round don't count.
        let pending_cull = (latest > 0
            && latest % config.cull_every == 0
            && !population
                .graveyard()
                .retired_in(latest..=latest)
                .iter()
                .any(|r| matches!(r.reason, RetirementReason::Culled { .. })))
        .then_some(latest);

        if let Some(round) = pending_cull {
            warn!(round, "Culling for last committed round is pending");
        }

        info!(
            population = population.len(),
            next_round = latest + 1,
            "Council opened"
        );

        let mut voting = VotingSystem::from_config(self.ballots, &config);
        voting.set_judge(self.judge);

        Ok(Council {
            executor: RoundExecutor::from_config(self.executor, &config),
            tracker: PerformanceTracker::from_config(&config),
            voting,
            population,
            store: self.store,
            events: self.events.unwrap_or_else(|| EventBus::new().shared()),
            machine: RoundStateMachine::new(),
            next_round_id: latest + 1,
            pending_cull,
            config,
        })
    }
}

pub struct Council {
    config: CouncilConfig,
    population: PopulationManager,
    executor: RoundExecutor,
    voting: VotingSystem,
    tracker: PerformanceTracker,
    store: SharedCouncilStore,
    events: SharedEventBus,
    machine: RoundStateMachine,
    next_round_id: RoundId,
    pending_cull: Option<RoundId>,
}

impl Council {
    pub fn builder(
        config: CouncilConfig,
        store: SharedCouncilStore,
        executor: SharedTaskExecutor,
        ballots: SharedBallotProvider,
    ) -> CouncilBuilder {
        CouncilBuilder {
            config,
            store,
            executor,
            ballots,
            judge: None,
            events: None,
        }
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    pub fn population(&self) -> &PopulationManager {
        &self.population
    }

    pub fn store(&self) -> &SharedCouncilStore {
        &self.store
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn phase(&self) -> CouncilPhase {
        self.machine.current()
    }

    pub fn state_machine(&self) -> &RoundStateMachine {
        &self.machine
    }

    /// The id the next `run_round` will use.
    pub fn next_round_id(&self) -> RoundId {
        self.next_round_id
    }

    /// Round whose culling still has to be committed, if any.
    pub fn pending_culling(&self) -> Option<RoundId> {
        self.pending_cull
    }

    /// Run one full round for `task`.
    ///
    /// Retries a pending culling first; if that still fails the round is
    /// not started.
    pub async fn run_round(&mut self, task: &Task) -> CouncilResult<RoundResult> {
        if let Some(round) = self.pending_cull {
            info!(round, "Retrying pending culling");
            self.cull(round)?;
        }

        if self.machine.current() != CouncilPhase::Idle {
            // A previous run_round was dropped mid-flight; nothing was applied
            self.machine.abort("previous round abandoned");
        }

        let round_id = self.next_round_id;
        let span = otel::round_span(round_id, &task.id);
        let start = Instant::now();

        let result = self
            .resolve_round(round_id, task)
            .instrument(span.clone())
            .await;

        if let Ok(result) = &result {
            otel::record_round_result(
                &span,
                result.winner,
                result.degraded,
                start.elapsed().as_millis() as u64,
            );
        }
        result
    }

    async fn resolve_round(&mut self, round_id: RoundId, task: &Task) -> CouncilResult<RoundResult> {
        let started_at = Utc::now();
        self.machine.begin_round(round_id)?;

        let snapshot = self.population.snapshot();
        let group_size = self.config.group_size;
        self.events.publish(CouncilEvent::RoundStarted {
            round_id,
            task_id: task.id.clone(),
            groups: snapshot.len() / group_size,
            held_out: snapshot.len() % group_size,
            timestamp: started_at,
        });

        self.machine.advance(CouncilPhase::Executing, None)?;
        let execution = self.executor.execute_round(round_id, task, &snapshot).await;
        self.machine.advance(CouncilPhase::Collecting, None)?;
        self.publish_group_events(&execution);

        let candidates = execution.candidates();
        let vote = if candidates.is_empty() {
            warn!(round_id, "No candidates, resolving round without a winner");
            None
        } else {
            self.machine.advance(CouncilPhase::Voting, None)?;
            match self.voting.run_vote(round_id, &candidates, &snapshot).await {
                Ok(vote) => Some(vote),
                Err(e) => {
                    self.machine.abort("vote failed");
                    return Err(e.into());
                }
            }
        };

        let winner = vote.as_ref().map(|v| v.winner);
        let degraded = vote.as_ref().is_some_and(|v| v.degraded);
        let outcomes = classify_outcomes(&execution, winner);

        // Everything below runs on a staged copy until the commit lands
        let mut staged = self.population.clone();
        let tracker = self
            .tracker
            .apply_round(round_id, staged.councillors_mut(), &outcomes);
        staged.promote_graduates(round_id);

        let record = RoundRecord {
            round_id,
            task_id: task.id.clone(),
            task_preview: task.preview(),
            groups: execution.reports.clone(),
            held_out: execution.held_out.clone(),
            winning_group: winner,
            status: if degraded {
                RoundStatus::QuorumFailed
            } else {
                RoundStatus::Resolved
            },
            member_outcomes: outcomes.into_iter().collect(),
            started_at,
            resolved_at: Utc::now(),
        };
        let session = vote.as_ref().map(|v: &VoteResult| v.session.clone());

        let commit = RoundCommit {
            round: record.clone(),
            vote_session: session.clone(),
            councillors: staged.councillors().cloned().collect(),
        };
        if let Err(source) = self.store.commit_round(&commit) {
            error!(round_id, error = %source, "Round commit failed, discarding round");
            self.events.publish(CouncilEvent::CommitFailed {
                round_id,
                stage: "round".into(),
                error: source.to_string(),
                timestamp: Utc::now(),
            });
            self.machine.abort("round commit failed");
            return Err(CouncilError::Commit { round_id, source });
        }

        self.population = staged;
        self.next_round_id = round_id + 1;
        if vote.is_none() {
            self.machine
                .advance(CouncilPhase::Resolved, Some("no candidates"))?;
        } else {
            self.machine.advance(CouncilPhase::Resolved, None)?;
        }

        self.events.publish(CouncilEvent::VoteResolved {
            round_id,
            winner,
            degraded,
            participating: session.as_ref().map_or(0, |s| s.participating),
            quorum_required: session.as_ref().map_or(0, |s| s.quorum_required),
            timestamp: Utc::now(),
        });
        info!(
            round_id,
            winner = ?winner,
            degraded,
            wins = tracker.wins,
            losses = tracker.losses,
            "Round resolved"
        );

        let mut culling = None;
        let mut culling_pending = false;
        if round_id % self.config.cull_every == 0 {
            match self.cull(round_id) {
                Ok(report) => culling = Some(report),
                Err(e) => {
                    culling_pending = self.pending_cull.is_some();
                    warn!(round_id, error = %e, culling_pending, "Culling did not complete");
                }
            }
        } else {
            self.machine.advance(CouncilPhase::Idle, None)?;
        }

        Ok(RoundResult {
            round_id,
            winner,
            winning_candidate: record.winning_candidate().cloned(),
            degraded,
            status: record.status,
            record,
            vote: session,
            tracker,
            culling,
            culling_pending,
        })
    }

    fn publish_group_events(&self, execution: &RoundExecution) {
        for report in &execution.reports {
            let event = match &report.outcome {
                GroupOutcome::Candidate(_) => CouncilEvent::GroupCompleted {
                    round_id: execution.round_id,
                    group_id: report.group.id,
                    attempts: report.attempts,
                    elapsed_ms: report.elapsed_ms,
                    timestamp: Utc::now(),
                },
                GroupOutcome::Failed(failure) => {
                    warn!(
                        round_id = execution.round_id,
                        group_id = report.group.id,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Group failed"
                    );
                    CouncilEvent::GroupFailed {
                        round_id: execution.round_id,
                        group_id: report.group.id,
                        kind: failure.kind,
                        message: failure.message.clone(),
                        timestamp: Utc::now(),
                    }
                }
            };
            self.events.publish(event);
        }
    }

    /// Run a culling cycle for `round` on a staged population and commit it.
    fn cull(&mut self, round: RoundId) -> CouncilResult<CullingReport> {
        let span = otel::culling_span(round, self.config.cull_count);
        let _guard = span.enter();

        self.machine.advance(CouncilPhase::Culling, Some("culling cycle"))?;

        let mut staged = self.population.clone();
        let report = match staged.run_culling_cycle(self.config.cull_count, round) {
            Ok(report) => report,
            Err(e) => {
                self.machine.abort("culling failed");
                return Err(e.into());
            }
        };

        self.machine.advance(CouncilPhase::Spawning, None)?;
        if let Err(e) = self.commit_population_change(round, staged, &report) {
            self.pending_cull = Some(round);
            return Err(e);
        }
        self.pending_cull = None;
        otel::record_culling_result(&span, report.fired_count(), report.spawned_count());

        self.events.publish(CouncilEvent::CullingCompleted {
            round_id: round,
            fired: report.fired_count(),
            spawned: report.spawned_count(),
            timestamp: Utc::now(),
        });
        self.machine.advance(CouncilPhase::Idle, None)?;
        Ok(report)
    }

    /// Retire one councillor by hand and spawn its replacement.
    ///
    /// A pending culling is committed first; if it still fails nothing is
    /// retired.
    pub fn retire_councillor(
        &mut self,
        id: CouncillorId,
        note: impl Into<String>,
    ) -> CouncilResult<CullingReport> {
        if let Some(pending) = self.pending_cull {
            info!(round = pending, "Retrying pending culling before manual retirement");
            self.cull(pending)?;
        }

        let round = self.next_round_id.saturating_sub(1);
        self.machine.advance(CouncilPhase::Culling, Some("manual retirement"))?;

        let mut staged = self.population.clone();
        let fired = match staged.retire(id, RetirementReason::Manual { note: note.into() }, round) {
            Ok(record) => record,
            Err(e) => {
                self.machine.abort("manual retirement rejected");
                return Err(e.into());
            }
        };
        let replacement = match staged.spawn(round) {
            Ok(c) => c,
            Err(e) => {
                self.machine.abort("replacement spawn failed");
                return Err(e.into());
            }
        };

        self.machine.advance(CouncilPhase::Spawning, None)?;
        let report = CullingReport {
            round_id: round,
            fired: vec![fired],
            spawned: vec![replacement],
        };
        self.commit_population_change(round, staged, &report)?;
        self.machine.advance(CouncilPhase::Idle, None)?;
        Ok(report)
    }

    fn commit_population_change(
        &mut self,
        round: RoundId,
        staged: PopulationManager,
        report: &CullingReport,
    ) -> CouncilResult<()> {
        if let Err(source) = self.store.commit_population(&report.to_commit()) {
            error!(round, error = %source, "Population commit failed, roster unchanged");
            self.events.publish(CouncilEvent::CommitFailed {
                round_id: round,
                stage: "population".into(),
                error: source.to_string(),
                timestamp: Utc::now(),
            });
            self.machine.abort("population commit failed");
            return Err(CouncilError::CullingCommit {
                round_id: round,
                source,
            });
        }

        self.population = staged;

        for record in &report.fired {
            self.events.publish(CouncilEvent::CouncillorRetired {
                round_id: round,
                councillor_id: record.id,
                lifetime_rounds: record.lifetime_rounds,
                reason: record.reason.clone(),
                timestamp: Utc::now(),
            });
        }
        for councillor in &report.spawned {
            self.events.publish(CouncilEvent::CouncillorSpawned {
                round_id: round,
                councillor_id: councillor.id,
                specialization: councillor.specialization,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }
}

/// Win for the winning group, loss for other candidate groups and agent
/// faults, no contest for held-out members, infra faults and rounds
/// without a winner.
fn classify_outcomes(
    execution: &RoundExecution,
    winner: Option<GroupId>,
) -> BTreeMap<CouncillorId, MemberOutcome> {
    let mut outcomes = BTreeMap::new();

    for id in &execution.held_out {
        outcomes.insert(*id, MemberOutcome::NoContest);
    }

    for report in &execution.reports {
        let outcome = match (winner, &report.outcome) {
            (None, _) => MemberOutcome::NoContest,
            (Some(w), GroupOutcome::Candidate(c)) if c.group_id == w => MemberOutcome::Win,
            (Some(_), GroupOutcome::Candidate(_)) => MemberOutcome::Loss,
            (Some(_), GroupOutcome::Failed(f)) if f.is_infra() => MemberOutcome::NoContest,
            (Some(_), GroupOutcome::Failed(_)) => MemberOutcome::Loss,
        };
        for id in &report.group.members {
            outcomes.insert(*id, outcome);
        }
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Group, GroupFailure, GroupReport};

    fn report(id: GroupId, members: &[u64], outcome: GroupOutcome) -> GroupReport {
        GroupReport {
            group: Group {
                id,
                round_id: 1,
                members: members.iter().map(|&m| CouncillorId(m)).collect(),
                specializations: Vec::new(),
            },
            outcome,
            attempts: 1,
            elapsed_ms: 5,
        }
    }

    fn candidate(id: GroupId, members: &[u64]) -> GroupOutcome {
        GroupOutcome::Candidate(Candidate {
            group_id: id,
            authors: members.iter().map(|&m| CouncillorId(m)).collect(),
            content: String::new(),
            confidence: 0.5,
        })
    }

    fn execution() -> RoundExecution {
        RoundExecution {
            round_id: 1,
            reports: vec![
                report(0, &[1, 2], candidate(0, &[1, 2])),
                report(1, &[3, 4], candidate(1, &[3, 4])),
                report(2, &[5, 6], GroupOutcome::Failed(GroupFailure::agent_fault("x"))),
                report(3, &[7, 8], GroupOutcome::Failed(GroupFailure::infra_fault("y"))),
            ],
            held_out: vec![CouncillorId(9)],
            elapsed_ms: 10,
        }
    }

    #[test]
    fn test_classify_outcomes_with_winner() {
        let outcomes = classify_outcomes(&execution(), Some(1));
        let get = |id| outcomes.get(&CouncillorId(id)).copied();

        assert_eq!(get(1), Some(MemberOutcome::Loss));
        assert_eq!(get(3), Some(MemberOutcome::Win));
        assert_eq!(get(5), Some(MemberOutcome::Loss));
        assert_eq!(get(7), Some(MemberOutcome::NoContest));
        assert_eq!(get(9), Some(MemberOutcome::NoContest));
        assert_eq!(outcomes.len(), 9);
    }

    #[test]
    fn test_classify_outcomes_without_winner() {
        let outcomes = classify_outcomes(&execution(), None);
        assert!(outcomes.values().all(|o| *o == MemberOutcome::NoContest));
    }
}
