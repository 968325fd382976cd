//! Competitive Council
//!
//! Several groups of councillors attempt the same task in parallel, a
//! weighted vote picks the best candidate, and a periodic culling cycle
//! retires the weakest councillors and spawns fresh replacements.
//!
//! # Components
//!
//! - [`executor`]: partitions the roster into groups and runs them
//!   concurrently against a [`TaskExecutor`], bounded by a round deadline
//! - [`voting`]: weighted `BEST_ANSWER` vote with quorum and a
//!   deterministic degraded-mode fallback
//! - [`tracker`]: EMA performance and bounded happiness updates
//! - [`population`]: spawning, culling, probation and the graveyard
//! - [`state`]: council records and the [`CouncilStore`] persistence seam
//!   (RocksDB behind the `heavy-state` feature)
//! - [`council`]: the orchestrator that ties a round together and commits
//!   it atomically
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use council::{Council, CouncilConfig, MemoryStore, Task};
//!
//! let mut council = Council::builder(
//!     CouncilConfig::from_env(),
//!     MemoryStore::new().shared(),
//!     Arc::new(MyExecutor),
//!     Arc::new(MyBallots),
//! )
//! .open()?;
//!
//! let result = council.run_round(&Task::new("Summarize the incident")).await?;
//! println!("winner: {:?} degraded: {}", result.winner, result.degraded);
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod council;
pub mod events;
pub mod executor;
pub mod otel;
pub mod population;
pub mod state;
pub mod state_machine;
pub mod tracker;
pub mod voting;

pub use config::{
    CouncilConfig, ConfigError, ConfigResult, CullKey, HappinessParams, PolicyKind, QuorumRule,
    ScalingCurve, WeightParams,
};
pub use council::{Council, CouncilBuilder, CouncilError, CouncilResult, RoundResult};
pub use events::{CouncilEvent, EventBus, SharedEventBus};
pub use executor::{partition, Partition, RoundExecution, RoundExecutor, TaskExecutor};
pub use population::{
    CullingReport, Graveyard, PopulationError, PopulationManager, PopulationSettings,
    SpecializationPolicy,
};
pub use state::{
    Ballot, Candidate, Councillor, CouncillorId, CouncilStore, GroupFailure, MemoryStore, Task,
    Submission,
};
#[cfg(feature = "heavy-state")]
pub use state::RocksStore;
pub use state_machine::{CouncilPhase, IllegalTransition, RoundStateMachine};
pub use tracker::{PerformanceTracker, TrackerSummary};
pub use voting::{BallotProvider, Judge, VoteResult, VotingError, VotingSystem};
