//! Append-only retirement ledger
//!
//! Records are only ever added through [`super::PopulationManager::retire`]
//! and never removed. An id present here can not re-enter the roster.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use crate::state::{CouncillorId, GraveyardRecord, RoundId};

#[derive(Debug, Clone, Default)]
pub struct Graveyard {
    records: Vec<GraveyardRecord>,
    ids: BTreeSet<CouncillorId>,
}

impl Graveyard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records. Duplicate ids keep the first record.
    pub fn from_records(records: impl IntoIterator<Item = GraveyardRecord>) -> Self {
        let mut graveyard = Self::new();
        for record in records {
            if !graveyard.contains(record.id) {
                graveyard.archive(record);
            }
        }
        graveyard
    }

    pub(crate) fn archive(&mut self, record: GraveyardRecord) {
        self.ids.insert(record.id);
        self.records.push(record);
    }

    pub fn get(&self, id: CouncillorId) -> Option<&GraveyardRecord> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.records.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: CouncillorId) -> bool {
        self.ids.contains(&id)
    }

    /// All records in archive order.
    pub fn records(&self) -> &[GraveyardRecord] {
        &self.records
    }

    pub fn total_retirements(&self) -> usize {
        self.records.len()
    }

    /// Highest archived id, used to seed id allocation on restore.
    pub fn max_id(&self) -> Option<CouncillorId> {
        self.ids.iter().next_back().copied()
    }

    /// Mean `lifetime_rounds` across all records, `None` when empty.
    pub fn average_lifetime(&self) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let total: u64 = self.records.iter().map(|r| r.lifetime_rounds).sum();
        Some(total as f64 / self.records.len() as f64)
    }

    pub fn retired_in(&self, rounds: RangeInclusive<RoundId>) -> Vec<&GraveyardRecord> {
        self.records
            .iter()
            .filter(|r| rounds.contains(&r.retirement_round))
            .collect()
    }

    /// Retirement counts keyed by reason label.
    pub fn count_by_reason(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.reason.label()).or_insert(0) += 1;
        }
        counts
    }
}
