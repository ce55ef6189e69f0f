//! Offline evaluator for a region-rebalancing scheduler.
//!
//! A scenario seeds a simulated cluster of stores and regions. The
//! [`driver`] ticks it against a scheduler reached through
//! `drift_sched::scheduler::SchedulerClient`: nodes heartbeat their state,
//! scheduling decisions come back as [`task`]s, and the [`raft`] engine
//! applies every region mutation. A run passes once the scenario's checker
//! reports convergence.

pub mod cluster;
pub mod config;
pub mod driver;
pub mod event;
pub mod keys;
pub mod node;
pub mod raft;
pub mod region_store;
pub mod scenario;
pub mod stats;
pub mod task;

pub use config::SimConfig;
pub use driver::{Driver, RunOutcome, RunReport};
pub use scenario::{Scenario, ScenarioError};
