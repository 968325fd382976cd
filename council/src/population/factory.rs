//! Specialization assignment for new councillors

use std::fmt;
use std::sync::Arc;

use crate::config::PolicyKind;
use crate::state::{Councillor, CouncillorId, Specialization};

/// Chooses the specialization of the next spawned councillor.
///
/// Policies are stateless: the choice depends only on the new id and the
/// current active roster, so a restored council keeps assigning the same
/// way it did before the restart.
pub trait SpecializationPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn choose(&self, id: CouncillorId, roster: &[&Councillor]) -> Specialization;
}

pub type SharedPolicy = Arc<dyn SpecializationPolicy>;

/// Cycles through [`Specialization::ALL`] by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl SpecializationPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn choose(&self, id: CouncillorId, _roster: &[&Councillor]) -> Specialization {
        // Ids start at 1
        let slot = id.0.saturating_sub(1) % Specialization::ALL.len() as u64;
        Specialization::ALL[slot as usize]
    }
}

/// Picks the least represented tag; ties go to declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeedBased;

impl SpecializationPolicy for NeedBased {
    fn name(&self) -> &'static str {
        "need_based"
    }

    fn choose(&self, _id: CouncillorId, roster: &[&Councillor]) -> Specialization {
        let mut counts = [0usize; Specialization::ALL.len()];
        for councillor in roster {
            counts[councillor.specialization.index()] += 1;
        }

        // min_by_key keeps the first minimum
        Specialization::ALL
            .iter()
            .copied()
            .min_by_key(|tag| counts[tag.index()])
            .unwrap_or(Specialization::Analyst)
    }
}

pub fn policy_from_kind(kind: PolicyKind) -> SharedPolicy {
    match kind {
        PolicyKind::RoundRobin => Arc::new(RoundRobin),
        PolicyKind::NeedBased => Arc::new(NeedBased),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn councillor(id: u64, spec: Specialization) -> Councillor {
        Councillor::new(CouncillorId(id), spec, 0, 0.5, 50.0, 5)
    }

    #[test]
    fn test_round_robin_cycles_by_id() {
        let policy = RoundRobin;
        let picks: Vec<Specialization> = (1..=7)
            .map(|id| policy.choose(CouncillorId(id), &[]))
            .collect();
        assert_eq!(picks[0], Specialization::Analyst);
        assert_eq!(picks[4], Specialization::Strategist);
        assert_eq!(picks[5], Specialization::Analyst);
        assert_eq!(picks[6], Specialization::Builder);
    }

    #[test]
    fn test_need_based_fills_gaps() {
        let a = councillor(1, Specialization::Analyst);
        let b = councillor(2, Specialization::Builder);
        let c = councillor(3, Specialization::Critic);
        let r = councillor(4, Specialization::Researcher);
        let policy = NeedBased;

        assert_eq!(
            policy.choose(CouncillorId(5), &[&a, &b, &c, &r]),
            Specialization::Strategist
        );
        // Everyone represented once: first in declaration order
        let s = councillor(5, Specialization::Strategist);
        assert_eq!(
            policy.choose(CouncillorId(6), &[&a, &b, &c, &r, &s]),
            Specialization::Analyst
        );
        assert_eq!(policy.choose(CouncillorId(1), &[]), Specialization::Analyst);
    }

    #[test]
    fn test_policy_from_kind() {
        assert_eq!(policy_from_kind(PolicyKind::RoundRobin).name(), "round_robin");
        assert_eq!(policy_from_kind(PolicyKind::NeedBased).name(), "need_based");
    }
}
