//! Property-style tests for the council lifecycle.
//!
//! Drives councils through many rounds with mixed executor faults and
//! ballot patterns and checks the invariants that must hold after every
//! round:
//! - Population size stays at N and every culling fires as many as it spawns
//! - Happiness stays within [0, 100] and performance within [0, 1]
//! - Probationary councillors are never culled
//! - Councillor ids are never reused
//! - The same inputs always resolve to the same winners

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use council::state::{Group, RoundId};
use council::{
    Ballot, BallotProvider, Candidate, Council, CouncilConfig, Councillor, CouncillorId,
    GroupFailure, MemoryStore, Submission, Task, TaskExecutor, VotingSystem,
};

/// Deterministic mix: `fault_every` controls how often a group fails and
/// alternates the failure between agent and infra faults.
struct Mixed {
    fault_every: u64,
}

#[async_trait]
impl TaskExecutor for Mixed {
    async fn execute(&self, _task: &Task, group: &Group) -> Result<Submission, GroupFailure> {
        let key = group.round_id * 31 + group.id as u64 * 7 + group.members[0].0;
        if self.fault_every > 0 && key % self.fault_every == 0 {
            if key % 2 == 0 {
                return Err(GroupFailure::agent_fault("gave up"));
            }
            return Err(GroupFailure::infra_fault("connection reset"));
        }
        Ok(Submission::new(format!("answer {}", key), 0.5))
    }
}

/// Votes spread across candidates; some voters abstain some rounds.
struct Spread;

#[async_trait]
impl BallotProvider for Spread {
    async fn cast(&self, round_id: RoundId, voter: &Councillor, candidates: &[Candidate]) -> Option<Ballot> {
        if (voter.id.0 + round_id) % 5 == 0 {
            return None;
        }
        let pick = (voter.id.0 * 3 + round_id * 11) as usize % candidates.len();
        Some(Ballot::best_answer(voter.id, candidates[pick].group_id))
    }
}

fn config(population_size: usize, group_size: usize) -> CouncilConfig {
    CouncilConfig {
        population_size,
        group_size,
        min_population: population_size / 2,
        ..CouncilConfig::default()
    }
}

fn open(config: CouncilConfig, fault_every: u64) -> Council {
    Council::builder(
        config,
        MemoryStore::new().shared(),
        Arc::new(Mixed { fault_every }),
        Arc::new(Spread),
    )
    .open()
    .unwrap()
}

fn task(round: RoundId) -> Task {
    Task::with_id(format!("task-{}", round), format!("Problem {}", round))
}

// ── Property: population size and culling balance ──────────────────

#[tokio::test]
async fn prop_population_constant_across_cycles() {
    for (n, g) in [(9, 3), (10, 3), (12, 4), (7, 2)] {
        for fault_every in [0, 3, 5] {
            let mut council = open(config(n, g), fault_every);
            for round in 1..=45 {
                let result = council.run_round(&task(round)).await.unwrap();
                if let Some(report) = &result.culling {
                    assert_eq!(report.fired_count(), report.spawned_count());
                    assert!(report.fired_count() <= 3);
                }
                assert_eq!(council.population().len(), n, "N={} G={} round {}", n, g, round);
            }
            assert_eq!(council.population().graveyard().total_retirements(), 12);
        }
    }
}

// ── Property: happiness and performance bounds ─────────────────────

#[tokio::test]
async fn prop_scores_stay_bounded() {
    for fault_every in [0, 2, 3, 7] {
        let mut council = open(config(9, 3), fault_every);
        for round in 1..=60 {
            council.run_round(&task(round)).await.unwrap();
            for c in council.population().councillors() {
                assert!(
                    (0.0..=100.0).contains(&c.happiness),
                    "{} happiness {} out of range",
                    c.id,
                    c.happiness
                );
                assert!((0.0..=1.0).contains(&c.performance_score));
                assert!(c.history.len() <= c.history.capacity());
            }
        }
    }
}

// ── Property: probation protects new councillors ───────────────────

#[tokio::test]
async fn prop_probationers_never_culled() {
    let configs = [
        CouncilConfig {
            cull_every: 3,
            probation_rounds: 5,
            ..config(9, 3)
        },
        CouncilConfig {
            cull_every: 2,
            probation_rounds: 4,
            cull_count: 2,
            ..config(8, 2)
        },
    ];

    for cfg in configs {
        let probation_rounds = cfg.probation_rounds;
        let mut council = open(cfg, 4);
        for round in 1..=40 {
            council.run_round(&task(round)).await.unwrap();
        }

        for record in council.population().graveyard().records() {
            assert!(
                record.lifetime_rounds >= probation_rounds,
                "{} culled after {} rounds",
                record.id,
                record.lifetime_rounds
            );
        }
    }
}

// ── Property: ids are unique for the council's lifetime ────────────

#[tokio::test]
async fn prop_ids_never_reused() {
    let mut council = open(config(9, 3), 3);
    let mut seen: BTreeSet<CouncillorId> = council.population().councillors().map(|c| c.id).collect();

    for round in 1..=50 {
        let result = council.run_round(&task(round)).await.unwrap();
        if let Some(report) = result.culling {
            for c in &report.spawned {
                assert!(seen.insert(c.id), "{} issued twice", c.id);
            }
        }
    }

    let archived: BTreeSet<CouncillorId> = council
        .population()
        .graveyard()
        .records()
        .iter()
        .map(|r| r.id)
        .collect();
    for c in council.population().councillors() {
        assert!(!archived.contains(&c.id));
    }
    assert_eq!(seen.len(), 9 + archived.len());
}

// ── Property: determinism ──────────────────────────────────────────

#[tokio::test]
async fn prop_same_inputs_same_winners() {
    for fault_every in [0, 3] {
        let mut a = open(config(9, 3), fault_every);
        let mut b = open(config(9, 3), fault_every);
        for round in 1..=25 {
            let ra = a.run_round(&task(round)).await.unwrap();
            let rb = b.run_round(&task(round)).await.unwrap();
            assert_eq!(ra.winner, rb.winner, "round {}", round);
            assert_eq!(ra.degraded, rb.degraded);
            assert_eq!(ra.record.member_outcomes, rb.record.member_outcomes);
        }
    }
}

#[test]
fn prop_tally_ignores_candidate_order() {
    let cfg = CouncilConfig::default();
    let voting = VotingSystem::from_config(Arc::new(Spread), &cfg);

    let voters: Vec<Councillor> = (1..=9)
        .map(|id| {
            let spec = council::state::Specialization::ALL[(id as usize - 1) % 5];
            Councillor::new(CouncillorId(id), spec, 0, 0.1 * id as f64, 50.0, 10)
        })
        .collect();
    let candidates: Vec<Candidate> = (0..3u32)
        .map(|g| Candidate {
            group_id: g,
            authors: (1..=3).map(|i| CouncillorId(g as u64 * 3 + i)).collect(),
            content: format!("answer {}", g),
            confidence: 0.5,
        })
        .collect();

    // Quorum met and quorum failed ballot sets
    let ballot_sets: Vec<Vec<Ballot>> = vec![
        (1..=9)
            .map(|id| Ballot::best_answer(CouncillorId(id), ((id as u32 + 1) / 3) % 3))
            .collect(),
        vec![Ballot::best_answer(CouncillorId(9), 0)],
        Vec::new(),
    ];

    for ballots in &ballot_sets {
        let expected = voting.tally(1, &candidates, &voters, ballots).unwrap();
        for rotation in 1..candidates.len() {
            let mut shuffled = candidates.clone();
            shuffled.rotate_left(rotation);
            let got = voting.tally(1, &shuffled, &voters, ballots).unwrap();
            assert_eq!(got.winner, expected.winner);
            assert_eq!(got.degraded, expected.degraded);
            assert_eq!(got.session.tallies, expected.session.tallies);
        }
        let mut reversed = candidates.clone();
        reversed.reverse();
        let got = voting.tally(1, &reversed, &voters, ballots).unwrap();
        assert_eq!(got.winner, expected.winner);
    }
}
