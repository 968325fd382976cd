//! Deterministic simulated collaborators.
//!
//! Every random-looking decision is a blake3 hash of the seed and the ids
//! involved, so the same seed replays the same run. Each councillor has a
//! latent skill; a group's answer quality is the mean skill of its members
//! plus per-round noise, and voters see that quality through their own
//! noise. Over many rounds skilled councillors win more and survive culling.

use std::time::Duration;

use async_trait::async_trait;
use council::state::{Group, RoundId, VoteType, VoterRef};
use council::{
    Ballot, BallotProvider, Candidate, Councillor, CouncillorId, GroupFailure, Judge, Submission,
    Task, TaskExecutor,
};

// Domain tags keep unrelated draws independent
const TAG_FAULT: u64 = 1;
const TAG_LATENCY: u64 = 2;
const TAG_SKILL: u64 = 3;
const TAG_ROUND_NOISE: u64 = 4;
const TAG_ABSTAIN: u64 = 5;
const TAG_PERCEPTION: u64 = 6;

/// Uniform draw in [0, 1) keyed by `seed` and `parts`.
fn unit(seed: u64, parts: &[u64]) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    for part in parts {
        hasher.update(&part.to_le_bytes());
    }
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

/// Latent skill of a councillor, in [0.2, 0.8).
pub fn skill(seed: u64, id: CouncillorId) -> f64 {
    0.2 + 0.6 * unit(seed, &[TAG_SKILL, id.0])
}

fn group_quality(seed: u64, group: &Group) -> f64 {
    if group.members.is_empty() {
        return 0.0;
    }
    let mean =
        group.members.iter().map(|id| skill(seed, *id)).sum::<f64>() / group.members.len() as f64;
    let noise = unit(seed, &[TAG_ROUND_NOISE, group.round_id, group.id as u64]) - 0.5;
    (mean + 0.2 * noise).clamp(0.0, 1.0)
}

/// Produces a submission per group, or a fault at the configured rates.
///
/// The fault roll is keyed by round and group, so a group that faults
/// faults again on every retry within that round.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    pub seed: u64,
    pub agent_fault_rate: f64,
    pub infra_fault_rate: f64,
    /// Mean simulated latency; actual latency is 0.5x–1.5x this.
    pub latency: Duration,
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task, group: &Group) -> Result<Submission, GroupFailure> {
        let key = [group.round_id, group.id as u64];

        if !self.latency.is_zero() {
            let jitter = unit(self.seed, &[TAG_LATENCY, key[0], key[1]]);
            tokio::time::sleep(self.latency.mul_f64(0.5 + jitter)).await;
        }

        let roll = unit(self.seed, &[TAG_FAULT, key[0], key[1]]);
        if roll < self.infra_fault_rate {
            return Err(GroupFailure::infra_fault("simulated transport error"));
        }
        if roll < self.infra_fault_rate + self.agent_fault_rate {
            return Err(GroupFailure::agent_fault("group could not agree on an answer"));
        }

        let quality = group_quality(self.seed, group);
        let roles: Vec<String> = group.specializations.iter().map(|s| s.to_string()).collect();
        Ok(Submission::new(
            format!(
                "[{}] answer to {} (quality {:.2})",
                roles.join("+"),
                task.id,
                quality
            ),
            quality,
        ))
    }
}

/// Each voter picks the other candidate it perceives as best.
#[derive(Debug, Clone)]
pub struct SimulatedBallots {
    pub seed: u64,
    pub abstain_rate: f64,
    /// Width of each voter's perception noise.
    pub noise: f64,
}

#[async_trait]
impl BallotProvider for SimulatedBallots {
    async fn cast(
        &self,
        round_id: RoundId,
        voter: &Councillor,
        candidates: &[Candidate],
    ) -> Option<Ballot> {
        if unit(self.seed, &[TAG_ABSTAIN, round_id, voter.id.0]) < self.abstain_rate {
            return None;
        }

        candidates
            .iter()
            .filter(|c| !c.authors.contains(&voter.id))
            .map(|c| {
                let draw = unit(
                    self.seed,
                    &[TAG_PERCEPTION, round_id, voter.id.0, c.group_id as u64],
                );
                (c.confidence + self.noise * (draw - 0.5), c.group_id)
            })
            // Lowest group id wins perceived ties
            .max_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(perceived, group_id)| {
                Ballot::best_answer(voter.id, group_id)
                    .with_rationale(format!("perceived quality {:.2}", perceived))
            })
    }
}

/// Advisory reviewer that flags the highest-confidence candidate.
#[derive(Debug, Clone, Default)]
pub struct SimulatedJudge;

#[async_trait]
impl Judge for SimulatedJudge {
    fn name(&self) -> &str {
        "sim-judge"
    }

    async fn advise(&self, _round_id: RoundId, candidates: &[Candidate]) -> Vec<Ballot> {
        candidates
            .iter()
            .max_by(|a, b| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then(b.group_id.cmp(&a.group_id))
            })
            .map(|best| {
                Ballot::advisory(
                    VoterRef::Judge(self.name().to_string()),
                    VoteType::Review,
                    best.group_id,
                )
            })
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use council::state::Specialization;

    fn group(round_id: RoundId, id: u32, members: &[u64]) -> Group {
        Group {
            id,
            round_id,
            members: members.iter().map(|m| CouncillorId(*m)).collect(),
            specializations: vec![Specialization::Analyst; members.len()],
        }
    }

    fn candidate(group_id: u32, authors: &[u64], confidence: f64) -> Candidate {
        Candidate {
            group_id,
            authors: authors.iter().map(|a| CouncillorId(*a)).collect(),
            content: String::new(),
            confidence,
        }
    }

    fn executor(agent_fault_rate: f64, infra_fault_rate: f64) -> SimulatedExecutor {
        SimulatedExecutor {
            seed: 7,
            agent_fault_rate,
            infra_fault_rate,
            latency: Duration::ZERO,
        }
    }

    #[test]
    fn test_unit_is_deterministic_and_in_range() {
        for i in 0..200 {
            let a = unit(42, &[i, 3]);
            assert_eq!(a, unit(42, &[i, 3]));
            assert!((0.0..1.0).contains(&a));
        }
        assert_ne!(unit(1, &[5]), unit(2, &[5]));
    }

    #[tokio::test]
    async fn test_executor_replays_same_submission() {
        let task = Task::with_id("t-1", "prompt");
        let g = group(3, 1, &[1, 2, 3]);
        let a = executor(0.0, 0.0).execute(&task, &g).await.unwrap();
        let b = executor(0.0, 0.0).execute(&task, &g).await.unwrap();
        assert_eq!(a, b);
        assert!((0.0..=1.0).contains(&a.confidence));
    }

    #[tokio::test]
    async fn test_executor_fault_rates() {
        let task = Task::with_id("t-1", "prompt");
        let g = group(1, 0, &[1, 2, 3]);

        let err = executor(0.0, 1.0).execute(&task, &g).await.unwrap_err();
        assert!(err.is_infra());
        let err = executor(1.0, 0.0).execute(&task, &g).await.unwrap_err();
        assert!(!err.is_infra());
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_latency_is_simulated() {
        let mut exec = executor(0.0, 0.0);
        exec.latency = Duration::from_millis(100);
        let start = tokio::time::Instant::now();
        exec.execute(&Task::new("p"), &group(1, 0, &[1])).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed <= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_ballots_skip_own_group() {
        let ballots = SimulatedBallots {
            seed: 7,
            abstain_rate: 0.0,
            noise: 0.0,
        };
        let candidates = vec![
            candidate(0, &[1, 2], 0.9),
            candidate(1, &[3, 4], 0.4),
            candidate(2, &[5, 6], 0.6),
        ];

        let voter = Councillor::new(CouncillorId(1), Specialization::Critic, 0, 0.5, 50.0, 10);
        let ballot = ballots.cast(1, &voter, &candidates).await.unwrap();
        assert_eq!(ballot.target, 2);

        let voter = Councillor::new(CouncillorId(3), Specialization::Critic, 0, 0.5, 50.0, 10);
        let ballot = ballots.cast(1, &voter, &candidates).await.unwrap();
        assert_eq!(ballot.target, 0);
    }

    #[tokio::test]
    async fn test_full_abstention() {
        let ballots = SimulatedBallots {
            seed: 7,
            abstain_rate: 1.0,
            noise: 0.1,
        };
        let voter = Councillor::new(CouncillorId(1), Specialization::Builder, 0, 0.5, 50.0, 10);
        assert!(ballots
            .cast(1, &voter, &[candidate(0, &[2], 0.5)])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_judge_reviews_best_candidate() {
        let ballots = SimulatedJudge
            .advise(1, &[candidate(0, &[1], 0.3), candidate(1, &[2], 0.8)])
            .await;
        assert_eq!(ballots.len(), 1);
        assert_eq!(ballots[0].target, 1);
        assert_eq!(ballots[0].vote_type, VoteType::Review);
        assert!(SimulatedJudge.advise(1, &[]).await.is_empty());
    }
}
