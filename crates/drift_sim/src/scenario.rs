//! Scenario catalog.
//!
//! A scenario is a pure factory over [`SimConfig`]: initial stores and
//! regions, scripted events, the split policy, and a convergence checker the
//! driver evaluates after every tick.

mod balance;
mod hot;
mod nodes;
mod ranges;
mod replicas;

use drift_sched::scheduler::{
    IdAllocator, Peer, Region, RegionEpoch, Store, StoreId, StoreStats,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::config::SimConfig;
use crate::event::Event;
use crate::keys;
use crate::raft::SplitPolicy;
use crate::region_store::RegionStore;

/// Relative tolerance of [`is_uniform`].
pub const UNIFORM_TOLERANCE: f64 = 0.05;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("unknown scenario {name:?}")]
    UnknownScenario { name: String },
    #[error("store_num must be at least 3, got {store_num}")]
    TooFewStores { store_num: usize },
    #[error("region_num must be positive")]
    NoRegions,
}

/// What a checker sees after a tick.
pub struct CheckContext<'a> {
    pub tick: u64,
    pub regions: &'a RegionStore,
    /// Stats of running stores, ordered by store id.
    pub stores: &'a [StoreStats],
}

pub type Checker = Box<dyn FnMut(&CheckContext<'_>) -> bool + Send>;

pub struct Scenario {
    pub name: &'static str,
    pub stores: Vec<Store>,
    pub regions: Vec<Region>,
    pub events: Vec<Event>,
    pub split: SplitPolicy,
    pub checker: Checker,
    /// Feed peer moves into a transfer counter during the run.
    pub analyze_transfers: bool,
    pub store_num: usize,
    pub region_num: usize,
}

type Factory = fn(&SimConfig) -> Scenario;

const CATALOG: &[(&str, Factory)] = &[
    ("balance-leader", balance::balance_leader),
    ("redundant-balance-region", balance::redundant_balance_region),
    ("add-nodes", nodes::add_nodes),
    ("add-nodes-dynamic", nodes::add_nodes_dynamic),
    ("delete-nodes", nodes::delete_nodes),
    ("region-split", ranges::region_split),
    ("region-merge", ranges::region_merge),
    ("hot-read", hot::hot_read),
    ("hot-write", hot::hot_write),
    ("makeup-down-replicas", replicas::makeup_down_replicas),
    ("import-data", ranges::import_data),
];

/// Scenario names in catalog order.
pub fn names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|(name, _)| *name)
}

pub fn build(name: &str, cfg: &SimConfig) -> Result<Scenario, ScenarioError> {
    if cfg.store_num < 3 {
        return Err(ScenarioError::TooFewStores {
            store_num: cfg.store_num,
        });
    }
    if cfg.region_num == 0 {
        return Err(ScenarioError::NoRegions);
    }
    let (_, factory) = CATALOG
        .iter()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| ScenarioError::UnknownScenario {
            name: name.to_string(),
        })?;
    Ok(factory(cfg))
}

/// `count` lies within [`UNIFORM_TOLERANCE`] of `mean`.
pub fn is_uniform(count: usize, mean: f64) -> bool {
    let count = count as f64;
    count >= mean * (1.0 - UNIFORM_TOLERANCE) && count <= mean * (1.0 + UNIFORM_TOLERANCE)
}

/// Spread between the largest and smallest value.
fn spread(counts: impl IntoIterator<Item = usize>) -> usize {
    let (min, max) = counts
        .into_iter()
        .fold((usize::MAX, 0), |(lo, hi), c| (lo.min(c), hi.max(c)));
    max.saturating_sub(min)
}

fn stores(cfg: &SimConfig, ids: impl IntoIterator<Item = StoreId>) -> Vec<Store> {
    ids.into_iter()
        .map(|id| Store::new(id, cfg.store_capacity(), cfg.store_available()))
        .collect()
}

/// Region bounds and ids for a scenario's initial layout.
struct Layout {
    ids: IdAllocator,
    /// Split points; region `i` covers `[points[i - 1], points[i])`.
    points: Vec<Vec<u8>>,
}

impl Layout {
    /// `regions` ranges cut at random keys.
    fn random(cfg: &SimConfig, regions: usize) -> Self {
        let mut rng = SmallRng::seed_from_u64(cfg.seed);
        let points = keys::generate_keys(&mut rng, regions.saturating_sub(1));
        Self::with_points(cfg.store_num, points)
    }

    fn with_points(store_num: usize, points: Vec<Vec<u8>>) -> Self {
        let ids = IdAllocator::new();
        // Keep region and peer ids clear of store ids.
        ids.reset_above(store_num as u64);
        Self { ids, points }
    }

    /// Region `index` with one voter per store in `hosts`, led by `leader`.
    fn region(&self, index: usize, hosts: &[StoreId], leader: StoreId, size: u64, keys: u64) -> Region {
        let id = self.ids.alloc();
        let peers: Vec<Peer> = hosts.iter().map(|s| Peer::voter(self.ids.alloc(), *s)).collect();
        let leader = peers.iter().copied().find(|p| p.store_id == leader);
        let start_key = match index {
            0 => Vec::new(),
            i => self.points.get(i - 1).cloned().unwrap_or_default(),
        };
        Region {
            id,
            start_key,
            end_key: self.points.get(index).cloned().unwrap_or_default(),
            epoch: RegionEpoch::new(1, 1),
            peers,
            leader,
            approximate_size: size,
            approximate_keys: keys,
            ..Region::default()
        }
    }
}

/// Regions of the balance family: `store_num * region_num / 3`.
fn balance_region_count(cfg: &SimConfig) -> usize {
    (cfg.store_num * cfg.region_num / 3).max(1)
}
