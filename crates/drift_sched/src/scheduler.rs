//! Scheduler module wiring.
//!
//! `types` holds the metadata model, `client` the async client contract,
//! `id_alloc` the monotonic id source, and `embedded` an in-process scheduler
//! whose planning lives in `planner` and `operator`.

mod client;
mod embedded;
mod id_alloc;
mod operator;
mod planner;
mod types;

pub use client::{ResponseStream, SchedulerClient, SchedulerConnector};
pub use embedded::{EmbeddedClient, EmbeddedScheduler, SchedulerConfig};
pub use id_alloc::IdAllocator;
pub use types::{
    key_in_range, ranges_overlap, ConfChangeType, Operation, Peer, PeerId, PeerRole, PeerStats,
    Region, RegionEpoch, RegionHeartbeatResponse, RegionId, Store, StoreId, StoreState,
    StoreStats, GIB, MIB,
};
