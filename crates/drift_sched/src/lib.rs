//! Scheduler contract crate.
//!
//! This crate defines the metadata shared between the simulated cluster and
//! the scheduler under test (stores, regions, peers, heartbeat responses), the
//! client surface nodes use to reach that scheduler, and an in-memory
//! scheduler that implements the surface for local runs and tests.

pub mod scheduler;
