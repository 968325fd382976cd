//! Population management
//!
//! [`PopulationManager`] owns the active roster (an arena keyed by stable
//! [`CouncillorId`]s) and the [`Graveyard`]. It is the only place
//! councillors are created or retired:
//!
//! - `spawn` issues a fresh id and a specialization from the policy
//! - `select_for_culling` ranks non-probationary councillors, worst first
//! - `retire` moves a councillor into the graveyard in one step
//! - `run_culling_cycle` retires k and spawns k, keeping N constant
//!
//! The council mutates a clone of the manager and only swaps it in after the
//! store commit succeeds.

pub mod factory;
pub mod graveyard;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CouncilConfig, CullKey};
use crate::state::{
    Councillor, CouncillorId, CouncillorStatus, GraveyardRecord, PopulationCommit,
    RetirementReason, RoundId,
};

pub use factory::{policy_from_kind, NeedBased, RoundRobin, SharedPolicy, SpecializationPolicy};
pub use graveyard::Graveyard;

/// Error type for population operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PopulationError {
    #[error("Unknown councillor: {0}")]
    UnknownCouncillor(CouncillorId),

    #[error("Councillor {0} is already retired")]
    AlreadyRetired(CouncillorId),

    #[error("Retiring would take the roster to {size}, below the floor of {min}")]
    FloorViolation { size: usize, min: usize },

    #[error("Councillor {0} is still on probation")]
    OnProbation(CouncillorId),

    #[error("Id {0} is already in use")]
    IdCollision(CouncillorId),
}

/// Result type for population operations
pub type PopulationResult<T> = Result<T, PopulationError>;

/// Roster shape and spawn defaults, taken from [`CouncilConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopulationSettings {
    pub population_size: usize,
    pub min_population: usize,
    pub probation_rounds: u64,
    pub baseline_performance: f64,
    pub baseline_happiness: f64,
    pub history_len: usize,
    pub culling_order: [CullKey; 3],
}

impl PopulationSettings {
    pub fn from_config(config: &CouncilConfig) -> Self {
        Self {
            population_size: config.population_size,
            min_population: config.min_population,
            probation_rounds: config.probation_rounds,
            baseline_performance: config.baseline_performance,
            baseline_happiness: config.happiness.neutral,
            history_len: config.history_len,
            culling_order: config.culling_order,
        }
    }
}

/// What one culling cycle did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CullingReport {
    pub round_id: RoundId,
    pub fired: Vec<GraveyardRecord>,
    pub spawned: Vec<Councillor>,
}

impl CullingReport {
    pub fn fired_count(&self) -> usize {
        self.fired.len()
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.len()
    }

    /// The store commit that persists this cycle.
    pub fn to_commit(&self) -> PopulationCommit {
        PopulationCommit {
            round_id: self.round_id,
            retired: self.fired.clone(),
            spawned: self.spawned.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PopulationManager {
    settings: PopulationSettings,
    roster: BTreeMap<CouncillorId, Councillor>,
    graveyard: Graveyard,
    next_id: u64,
    policy: SharedPolicy,
}

impl PopulationManager {
    pub fn new(settings: PopulationSettings, policy: SharedPolicy) -> Self {
        Self {
            settings,
            roster: BTreeMap::new(),
            graveyard: Graveyard::new(),
            next_id: 1,
            policy,
        }
    }

    pub fn from_config(config: &CouncilConfig) -> Self {
        Self::new(
            PopulationSettings::from_config(config),
            policy_from_kind(config.specialization_policy),
        )
    }

    /// Rebuild from persisted state. The next id is one past the highest id
    /// seen in either the roster or the graveyard.
    pub fn restore(
        settings: PopulationSettings,
        policy: SharedPolicy,
        councillors: Vec<Councillor>,
        graveyard: Vec<GraveyardRecord>,
    ) -> PopulationResult<Self> {
        let graveyard = Graveyard::from_records(graveyard);
        let mut roster = BTreeMap::new();

        for councillor in councillors {
            if graveyard.contains(councillor.id) {
                return Err(PopulationError::AlreadyRetired(councillor.id));
            }
            let id = councillor.id;
            if roster.insert(id, councillor).is_some() {
                return Err(PopulationError::IdCollision(id));
            }
        }

        let highest = roster
            .keys()
            .next_back()
            .copied()
            .into_iter()
            .chain(graveyard.max_id())
            .map(|id| id.0)
            .max()
            .unwrap_or(0);

        info!(
            active = roster.len(),
            retired = graveyard.total_retirements(),
            next_id = highest + 1,
            "Restored population"
        );

        Ok(Self {
            settings,
            roster,
            graveyard,
            next_id: highest + 1,
            policy,
        })
    }

    pub fn settings(&self) -> &PopulationSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn get(&self, id: CouncillorId) -> Option<&Councillor> {
        self.roster.get(&id)
    }

    /// Lifecycle status of any id this population has issued.
    pub fn status_of(&self, id: CouncillorId) -> Option<CouncillorStatus> {
        match self.roster.get(&id) {
            Some(c) => Some(c.status),
            None if self.graveyard.contains(id) => Some(CouncillorStatus::Retired),
            None => None,
        }
    }

    /// Active councillors in id order.
    pub fn councillors(&self) -> impl Iterator<Item = &Councillor> {
        self.roster.values()
    }

    pub(crate) fn councillors_mut(&mut self) -> impl Iterator<Item = &mut Councillor> {
        self.roster.values_mut()
    }

    /// Immutable copy of the roster in id order.
    pub fn snapshot(&self) -> Arc<[Councillor]> {
        self.roster.values().cloned().collect()
    }

    pub fn graveyard(&self) -> &Graveyard {
        &self.graveyard
    }

    /// The id the next spawn will receive.
    pub fn next_id(&self) -> CouncillorId {
        CouncillorId(self.next_id)
    }

    /// Spawn councillors until the roster reaches `population_size`.
    pub fn bootstrap(&mut self, round: RoundId) -> PopulationResult<Vec<Councillor>> {
        let mut spawned = Vec::new();
        while self.roster.len() < self.settings.population_size {
            spawned.push(self.spawn(round)?);
        }
        if !spawned.is_empty() {
            info!(round, spawned = spawned.len(), "Bootstrapped population");
        }
        Ok(spawned)
    }

    /// Create one probationary councillor with a fresh id.
    pub fn spawn(&mut self, round: RoundId) -> PopulationResult<Councillor> {
        let id = CouncillorId(self.next_id);
        if self.roster.contains_key(&id) || self.graveyard.contains(id) {
            return Err(PopulationError::IdCollision(id));
        }

        let current: Vec<&Councillor> = self.roster.values().collect();
        let specialization = self.policy.choose(id, &current);

        let councillor = Councillor::new(
            id,
            specialization,
            round,
            self.settings.baseline_performance,
            self.settings.baseline_happiness,
            self.settings.history_len,
        );

        self.next_id += 1;
        self.roster.insert(id, councillor.clone());
        debug!(%id, %specialization, round, "Spawned councillor");
        Ok(councillor)
    }

    /// The up to `k` worst non-probationary councillors, worst first.
    ///
    /// Ranked by `culling_order` (by default performance, then happiness,
    /// then age with older first), then id. `k` is capped so retiring them
    /// never breaches `min_population`.
    pub fn select_for_culling(&self, k: usize) -> Vec<CouncillorId> {
        let headroom = self
            .roster
            .len()
            .saturating_sub(self.settings.min_population);
        let k = k.min(headroom);

        let mut ranked: Vec<&Councillor> = self
            .roster
            .values()
            .filter(|c| !c.is_probationary())
            .collect();
        let order = self.settings.culling_order;
        ranked.sort_by(|a, b| {
            order
                .iter()
                .fold(Ordering::Equal, |acc, key| {
                    acc.then_with(|| compare_by(*key, a, b))
                })
                .then(a.id.cmp(&b.id))
        });

        ranked.into_iter().take(k).map(|c| c.id).collect()
    }

    /// Remove a councillor from the roster and archive it.
    pub fn retire(
        &mut self,
        id: CouncillorId,
        reason: RetirementReason,
        round: RoundId,
    ) -> PopulationResult<GraveyardRecord> {
        if self.graveyard.contains(id) {
            return Err(PopulationError::AlreadyRetired(id));
        }
        let councillor = self
            .roster
            .get(&id)
            .ok_or(PopulationError::UnknownCouncillor(id))?;
        if councillor.is_probationary() {
            return Err(PopulationError::OnProbation(id));
        }
        let remaining = self.roster.len() - 1;
        if remaining < self.settings.min_population {
            return Err(PopulationError::FloorViolation {
                size: remaining,
                min: self.settings.min_population,
            });
        }

        let record = GraveyardRecord::from_councillor(councillor, round, reason);
        self.roster.remove(&id);
        self.graveyard.archive(record.clone());

        info!(
            %id,
            round,
            lifetime_rounds = record.lifetime_rounds,
            performance = record.final_performance_score,
            reason = %record.reason,
            "Retired councillor"
        );
        Ok(record)
    }

    /// Move probationers who have served `probation_rounds` to active.
    pub fn promote_graduates(&mut self, round: RoundId) -> Vec<CouncillorId> {
        let probation_rounds = self.settings.probation_rounds;
        let mut promoted = Vec::new();

        for councillor in self.roster.values_mut() {
            if councillor.is_probationary() && councillor.rounds_served(round) >= probation_rounds {
                councillor.status = CouncillorStatus::Active;
                promoted.push(councillor.id);
            }
        }

        if !promoted.is_empty() {
            debug!(round, promoted = promoted.len(), "Promoted probationers");
        }
        promoted
    }

    /// Retire the `k` worst councillors and spawn the same number of
    /// replacements.
    pub fn run_culling_cycle(&mut self, k: usize, round: RoundId) -> PopulationResult<CullingReport> {
        let selected = self.select_for_culling(k);

        let mut fired = Vec::with_capacity(selected.len());
        for (rank, id) in selected.into_iter().enumerate() {
            fired.push(self.retire(id, RetirementReason::Culled { rank }, round)?);
        }

        let mut spawned = Vec::with_capacity(fired.len());
        for _ in 0..fired.len() {
            spawned.push(self.spawn(round)?);
        }

        info!(
            round,
            fired = fired.len(),
            spawned = spawned.len(),
            population = self.roster.len(),
            "Culling cycle complete"
        );

        Ok(CullingReport {
            round_id: round,
            fired,
            spawned,
        })
    }
}

fn compare_by(key: CullKey, a: &Councillor, b: &Councillor) -> Ordering {
    match key {
        CullKey::Performance => a.performance_score.total_cmp(&b.performance_score),
        CullKey::Happiness => a.happiness.total_cmp(&b.happiness),
        CullKey::Age => a.created_round.cmp(&b.created_round),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PopulationSettings {
        PopulationSettings::from_config(&CouncilConfig::default())
    }

    fn manager() -> PopulationManager {
        let mut m = PopulationManager::new(settings(), Arc::new(RoundRobin));
        m.bootstrap(0).unwrap();
        m
    }

    fn set_scores(m: &mut PopulationManager, scores: &[(u64, f64, f64)]) {
        for c in m.councillors_mut() {
            if let Some((_, perf, happy)) = scores.iter().find(|(id, _, _)| *id == c.id.0) {
                c.performance_score = *perf;
                c.happiness = *happy;
            }
        }
    }

    #[test]
    fn test_bootstrap_fills_roster() {
        let m = manager();
        assert_eq!(m.len(), 9);
        assert_eq!(m.next_id(), CouncillorId(10));
        assert!(m.councillors().all(|c| c.is_probationary()));
        assert!(m.councillors().all(|c| c.performance_score == 0.5));
        assert_eq!(m.snapshot().len(), 9);
    }

    #[test]
    fn test_probationers_are_never_selected() {
        let m = manager();
        assert!(m.select_for_culling(3).is_empty());
    }

    #[test]
    fn test_promotion_after_probation() {
        let mut m = manager();
        assert!(m.promote_graduates(4).is_empty());
        assert_eq!(m.promote_graduates(5).len(), 9);
        assert!(m.councillors().all(|c| c.status == CouncillorStatus::Active));
    }

    #[test]
    fn test_status_of_covers_roster_and_graveyard() {
        let mut m = manager();
        assert_eq!(m.status_of(CouncillorId(1)), Some(CouncillorStatus::Probation));
        m.promote_graduates(5);
        assert_eq!(m.status_of(CouncillorId(1)), Some(CouncillorStatus::Active));

        m.retire(CouncillorId(1), RetirementReason::Manual { note: "test".into() }, 6)
            .unwrap();
        assert_eq!(m.status_of(CouncillorId(1)), Some(CouncillorStatus::Retired));
        assert!(m.councillors().all(|c| c.status != CouncillorStatus::Retired));
        assert_eq!(m.status_of(CouncillorId(99)), None);
    }

    #[test]
    fn test_culling_order_and_tiebreaks() {
        let mut m = manager();
        m.promote_graduates(5);
        set_scores(
            &mut m,
            &[
                (1, 0.9, 50.0),
                (2, 0.2, 60.0),
                (3, 0.2, 40.0),
                (4, 0.3, 50.0),
                (5, 0.2, 40.0),
            ],
        );

        // 3 and 5 tie on performance and happiness; same age, lower id first
        assert_eq!(
            m.select_for_culling(3),
            vec![CouncillorId(3), CouncillorId(5), CouncillorId(2)]
        );
    }

    #[test]
    fn test_configured_culling_order() {
        let config = CouncilConfig {
            culling_order: [CullKey::Happiness, CullKey::Performance, CullKey::Age],
            ..CouncilConfig::default()
        };
        let mut m = PopulationManager::new(
            PopulationSettings::from_config(&config),
            Arc::new(RoundRobin),
        );
        m.bootstrap(0).unwrap();
        m.promote_graduates(5);
        set_scores(
            &mut m,
            &[(1, 0.1, 70.0), (2, 0.9, 10.0), (3, 0.5, 10.0), (4, 0.2, 30.0)],
        );

        assert_eq!(
            m.select_for_culling(3),
            vec![CouncillorId(3), CouncillorId(2), CouncillorId(4)]
        );
    }

    #[test]
    fn test_select_caps_at_floor() {
        let mut m = manager();
        m.promote_graduates(5);
        // 9 active, floor 6
        assert_eq!(m.select_for_culling(8).len(), 3);
    }

    #[test]
    fn test_culling_cycle_keeps_size() {
        let mut m = manager();
        m.promote_graduates(5);
        set_scores(&mut m, &[(4, 0.1, 10.0), (7, 0.15, 10.0), (8, 0.12, 10.0)]);

        let report = m.run_culling_cycle(3, 10).unwrap();

        assert_eq!(report.fired_count(), report.spawned_count());
        assert_eq!(m.len(), 9);
        let fired: Vec<u64> = report.fired.iter().map(|r| r.id.0).collect();
        assert_eq!(fired, vec![4, 8, 7]);
        assert!(report.fired.iter().all(|r| r.lifetime_rounds == 10));
        let spawned: Vec<u64> = report.spawned.iter().map(|c| c.id.0).collect();
        assert_eq!(spawned, vec![10, 11, 12]);
        assert!(report.spawned.iter().all(|c| c.is_probationary()));
        assert_eq!(m.graveyard().total_retirements(), 3);

        let commit = report.to_commit();
        assert_eq!(commit.retired.len(), 3);
        assert_eq!(commit.spawned.len(), 3);
    }

    #[test]
    fn test_retire_validates_before_mutating() {
        let mut m = manager();
        assert_eq!(
            m.retire(CouncillorId(1), RetirementReason::Culled { rank: 0 }, 1),
            Err(PopulationError::OnProbation(CouncillorId(1)))
        );
        assert_eq!(
            m.retire(CouncillorId(99), RetirementReason::Culled { rank: 0 }, 1),
            Err(PopulationError::UnknownCouncillor(CouncillorId(99)))
        );

        m.promote_graduates(5);
        for id in 1..=3 {
            m.retire(CouncillorId(id), RetirementReason::Culled { rank: 0 }, 6)
                .unwrap();
        }
        // Roster at the floor of 6
        let err = m
            .retire(CouncillorId(4), RetirementReason::Culled { rank: 0 }, 6)
            .unwrap_err();
        assert_eq!(err, PopulationError::FloorViolation { size: 5, min: 6 });
        assert!(m.get(CouncillorId(4)).is_some());
        assert!(!m.graveyard().contains(CouncillorId(4)));

        assert_eq!(
            m.retire(CouncillorId(1), RetirementReason::Culled { rank: 0 }, 7),
            Err(PopulationError::AlreadyRetired(CouncillorId(1)))
        );
    }

    #[test]
    fn test_restore_never_reuses_ids() {
        let mut m = manager();
        m.promote_graduates(5);
        let report = m.run_culling_cycle(3, 10).unwrap();
        let roster: Vec<Councillor> = m.councillors().cloned().collect();

        let mut restored = PopulationManager::restore(
            settings(),
            Arc::new(NeedBased),
            roster,
            report.fired.clone(),
        )
        .unwrap();

        assert_eq!(restored.next_id(), CouncillorId(13));
        let fresh = restored.spawn(11).unwrap();
        assert_eq!(fresh.id, CouncillorId(13));
        assert!(report.fired.iter().all(|r| r.id != fresh.id));
    }

    #[test]
    fn test_restore_rejects_archived_ids_in_roster() {
        let mut m = manager();
        m.promote_graduates(5);
        let report = m.run_culling_cycle(1, 10).unwrap();
        let mut roster: Vec<Councillor> = m.councillors().cloned().collect();
        let ghost = Councillor::new(report.fired[0].id, report.fired[0].specialization, 0, 0.5, 50.0, 10);
        roster.push(ghost);

        let err = PopulationManager::restore(settings(), Arc::new(RoundRobin), roster, report.fired)
            .unwrap_err();
        assert!(matches!(err, PopulationError::AlreadyRetired(_)));
    }
}
