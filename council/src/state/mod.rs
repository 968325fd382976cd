//! Council state: core types and persistence
//!
//! This module holds the values that make up a council's durable record
//! and the store that keeps them:
//! - `Councillor` roster entries with scores, happiness and outcome history
//! - `RoundRecord` for every resolved round
//! - `VoteSession` for every vote that ran
//! - `GraveyardRecord` for every retirement
//!
//! # Stores
//!
//! - [`MemoryStore`]: in-process, used by tests and short-lived councils
//! - `RocksStore` (feature `heavy-state`): RocksDB with one column family
//!   per record kind and `WriteBatch` commits
//!
//! # Usage
//!
//! ```ignore
//! use council::state::{MemoryStore, CouncilStore};
//!
//! let store = MemoryStore::new().shared();
//! let latest = store.latest_round_id()?;
//! let graveyard = store.graveyard()?;
//! ```

#[cfg(feature = "heavy-state")]
pub mod rocks;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "heavy-state")]
pub use rocks::RocksStore;
pub use store::{
    CouncilStore, MemoryStore, PopulationCommit, RoundCommit, SharedCouncilStore, StoreError,
    StoreResult,
};
pub use types::*;
