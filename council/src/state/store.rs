//! Persistence seam for council state
//!
//! [`CouncilStore`] is the durable record of the council: the active roster,
//! resolved rounds, vote sessions and the graveyard. Writes only happen
//! through two atomic commits, one per resolved round and one per population
//! change, so a reader never observes a half-applied round.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::types::*;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "heavy-state")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Commit rejected: {0}")]
    Conflict(String),
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a council store
pub type SharedCouncilStore = Arc<dyn CouncilStore>;

/// Everything a resolved round changes, committed together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundCommit {
    pub round: RoundRecord,
    pub vote_session: Option<VoteSession>,
    /// Post-round state of every active councillor
    pub councillors: Vec<Councillor>,
}

/// A population change: retirements and spawns, committed together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationCommit {
    pub round_id: RoundId,
    pub retired: Vec<GraveyardRecord>,
    pub spawned: Vec<Councillor>,
}

/// Durable council state
pub trait CouncilStore: Send + Sync {
    /// Atomically persist a resolved round, its vote session and the
    /// updated roster.
    fn commit_round(&self, commit: &RoundCommit) -> StoreResult<()>;

    /// Atomically remove retired councillors, append their graveyard
    /// records and insert spawned councillors.
    fn commit_population(&self, commit: &PopulationCommit) -> StoreResult<()>;

    fn get_councillor(&self, id: CouncillorId) -> StoreResult<Option<Councillor>>;

    /// Active roster, sorted by id.
    fn list_councillors(&self) -> StoreResult<Vec<Councillor>>;

    /// Active roster sorted by performance descending, then id.
    fn councillors_by_performance(&self, limit: usize) -> StoreResult<Vec<Councillor>> {
        let mut councillors = self.list_councillors()?;
        councillors.sort_by(|a, b| {
            b.performance_score
                .total_cmp(&a.performance_score)
                .then(a.id.cmp(&b.id))
        });
        councillors.truncate(limit);
        Ok(councillors)
    }

    fn get_round(&self, round_id: RoundId) -> StoreResult<Option<RoundRecord>>;

    /// Rounds with `start <= round_id <= end`, ascending.
    fn rounds_in_range(&self, start: RoundId, end: RoundId) -> StoreResult<Vec<RoundRecord>>;

    fn latest_round_id(&self) -> StoreResult<Option<RoundId>>;

    fn get_vote_session(&self, round_id: RoundId) -> StoreResult<Option<VoteSession>>;

    /// Graveyard sorted by (retirement_round, id).
    fn graveyard(&self) -> StoreResult<Vec<GraveyardRecord>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    councillors: BTreeMap<CouncillorId, Councillor>,
    rounds: BTreeMap<RoundId, RoundRecord>,
    votes: BTreeMap<RoundId, VoteSession>,
    graveyard: Vec<GraveyardRecord>,
}

/// In-process store. Each commit runs under one write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedCouncilStore {
        Arc::new(self)
    }
}

impl CouncilStore for MemoryStore {
    fn commit_round(&self, commit: &RoundCommit) -> StoreResult<()> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;

        let round_id = commit.round.round_id;
        if state.rounds.contains_key(&round_id) {
            return Err(StoreError::Conflict(format!(
                "round {} already committed",
                round_id
            )));
        }

        state.rounds.insert(round_id, commit.round.clone());
        if let Some(session) = &commit.vote_session {
            state.votes.insert(round_id, session.clone());
        }
        for councillor in &commit.councillors {
            state.councillors.insert(councillor.id, councillor.clone());
        }
        Ok(())
    }

    fn commit_population(&self, commit: &PopulationCommit) -> StoreResult<()> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;

        for record in &commit.retired {
            if state.graveyard.iter().any(|r| r.id == record.id) {
                return Err(StoreError::Conflict(format!(
                    "{} is already archived",
                    record.id
                )));
            }
        }

        for record in &commit.retired {
            state.councillors.remove(&record.id);
            state.graveyard.push(record.clone());
        }
        for councillor in &commit.spawned {
            state.councillors.insert(councillor.id, councillor.clone());
        }
        Ok(())
    }

    fn get_councillor(&self, id: CouncillorId) -> StoreResult<Option<Councillor>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.councillors.get(&id).cloned())
    }

    fn list_councillors(&self) -> StoreResult<Vec<Councillor>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.councillors.values().cloned().collect())
    }

    fn get_round(&self, round_id: RoundId) -> StoreResult<Option<RoundRecord>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.rounds.get(&round_id).cloned())
    }

    fn rounds_in_range(&self, start: RoundId, end: RoundId) -> StoreResult<Vec<RoundRecord>> {
        if start > end {
            return Ok(Vec::new());
        }
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.rounds.range(start..=end).map(|(_, r)| r.clone()).collect())
    }

    fn latest_round_id(&self) -> StoreResult<Option<RoundId>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.rounds.keys().next_back().copied())
    }

    fn get_vote_session(&self, round_id: RoundId) -> StoreResult<Option<VoteSession>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.votes.get(&round_id).cloned())
    }

    fn graveyard(&self) -> StoreResult<Vec<GraveyardRecord>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut records = state.graveyard.clone();
        records.sort_by_key(|r| (r.retirement_round, r.id));
        Ok(records)
    }
}
