//! Column family definitions for the RocksDB council store
//!
//! Numeric ids are zero-padded so lexicographic key order matches numeric
//! order, which the range queries rely on.

use super::types::{CouncillorId, RoundId};

/// Column family for the active roster
pub const CF_COUNCILLORS: &str = "councillors";

/// Column family for resolved rounds
pub const CF_ROUNDS: &str = "rounds";

/// Column family for vote sessions
pub const CF_VOTES: &str = "votes";

/// Column family for the graveyard ledger
pub const CF_GRAVEYARD: &str = "graveyard";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_COUNCILLORS, CF_ROUNDS, CF_VOTES, CF_GRAVEYARD];

/// Key prefixes for compound keys
pub mod keys {
    use super::{CouncillorId, RoundId};

    pub const COUNCILLOR_PREFIX: &str = "cnl:";
    pub const ROUND_PREFIX: &str = "round:";
    pub const GRAVE_PREFIX: &str = "grave:";

    pub fn councillor(id: CouncillorId) -> String {
        format!("cnl:{:020}", id.0)
    }

    pub fn round(round_id: RoundId) -> String {
        format!("round:{:020}", round_id)
    }

    pub fn vote(round_id: RoundId) -> String {
        format!("vote:{:020}", round_id)
    }

    /// Graveyard key, ordered by retirement round then id
    pub fn grave(retirement_round: RoundId, id: CouncillorId) -> String {
        format!("grave:{:020}:{:020}", retirement_round, id.0)
    }

    /// Graveyard index by id alone, so an id is archived at most once
    pub fn grave_index(id: CouncillorId) -> String {
        format!("grave_id:{:020}", id.0)
    }

    /// Parse the round id back out of a round key
    pub fn parse_round(key: &str) -> Option<RoundId> {
        key.strip_prefix(ROUND_PREFIX)?.parse().ok()
    }
}
