pub mod agent;
pub mod audit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod lock;
pub mod paths;
pub mod phase;
pub mod plan;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod vcs;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{PlanEngine, RunPhaseResult};
