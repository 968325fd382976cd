//! Council event stream
//!
//! The council publishes one [`CouncilEvent`] per lifecycle step (round
//! start, group results, vote resolution, retirements, spawns, commit
//! failures) on an [`EventBus`]. Subscribers are observers only; nothing in
//! the council depends on them.
//!
//! ```ignore
//! let bus = EventBus::new().shared();
//! let mut rx = bus.subscribe();
//! let mut council = Council::builder(config, store, executor, ballots)
//!     .event_bus(bus.clone())
//!     .open()?;
//! council.run_round(&task).await?;
//! while let Ok(event) = rx.try_recv() {
//!     println!("{}", event.event_type());
//! }
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, SharedEventBus};
pub use types::CouncilEvent;
