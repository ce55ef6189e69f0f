use std::ops::ControlFlow;

use drift_sched::scheduler::{Region, StoreId, MIB};

use super::{balance_region_count, is_uniform, stores, CheckContext, Layout, Scenario};
use crate::config::SimConfig;
use crate::event::Event;
use crate::raft::SplitPolicy;

/// Ticks between two membership changes.
const MEMBERSHIP_INTERVAL: u64 = 100;

/// Stores that hold data when the run starts.
fn seeded_stores(cfg: &SimConfig) -> u64 {
    (cfg.store_num as u64 / 2).max(3)
}

/// Balance-family regions replicated round-robin over stores `1..=hosts`.
fn round_robin_regions(cfg: &SimConfig, hosts: u64) -> Vec<Region> {
    let count = balance_region_count(cfg);
    let layout = Layout::random(cfg, count);
    (0..count)
        .map(|i| {
            let peers: Vec<StoreId> = (0..3).map(|j| (i as u64 + j) % hosts + 1).collect();
            layout.region(i, &peers, peers[0], 96 * MIB, 960_000)
        })
        .collect()
}

/// Leaders and replicas are spread evenly over `expected` running stores.
fn balanced_checker(
    expected: usize,
    total_regions: usize,
) -> impl FnMut(&CheckContext<'_>) -> bool + Send {
    move |ctx: &CheckContext<'_>| {
        if ctx.stores.len() != expected {
            return false;
        }
        let leader_mean = total_regions as f64 / expected as f64;
        let peer_mean = (total_regions * 3) as f64 / expected as f64;
        ctx.stores.iter().all(|s| {
            let leaders = ctx.regions.leader_count(s.store_id);
            let peers = ctx.regions.region_count(s.store_id);
            tracing::debug!(tick = ctx.tick, store_id = s.store_id, leaders, peers, "store load");
            is_uniform(leaders, leader_mean) && is_uniform(peers, peer_mean)
        })
    }
}

/// Every store exists from the start but only the first half hold regions.
pub(super) fn add_nodes(cfg: &SimConfig) -> Scenario {
    let n = cfg.store_num as u64;
    let regions = round_robin_regions(cfg, seeded_stores(cfg));
    let total = regions.len();
    Scenario {
        name: "add-nodes",
        stores: stores(cfg, 1..=n),
        regions,
        events: Vec::new(),
        split: SplitPolicy::default(),
        checker: Box::new(balanced_checker(cfg.store_num, total)),
        analyze_transfers: false,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}

/// Starts with the seeded stores and adds one empty store per interval.
pub(super) fn add_nodes_dynamic(cfg: &SimConfig) -> Scenario {
    let n = cfg.store_num as u64;
    let k = seeded_stores(cfg).min(n);
    let regions = round_robin_regions(cfg, k);
    let total = regions.len();

    let mut next = k + 1;
    let add = Event::AddNodes(Box::new(move |tick: u64| {
        if next > n {
            return ControlFlow::Break(());
        }
        if tick % MEMBERSHIP_INTERVAL != 0 {
            return ControlFlow::Continue(None);
        }
        next += 1;
        ControlFlow::Continue(Some(next - 1))
    }));

    Scenario {
        name: "add-nodes-dynamic",
        stores: stores(cfg, 1..=k),
        regions,
        events: vec![add],
        split: SplitPolicy::default(),
        checker: Box::new(balanced_checker(cfg.store_num, total)),
        analyze_transfers: false,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}

/// Deletes the highest-numbered store every interval until two thirds of
/// the stores (at least 3) remain.
pub(super) fn delete_nodes(cfg: &SimConfig) -> Scenario {
    let n = cfg.store_num as u64;
    let keep = (n * 2 / 3).max(3);
    let regions = round_robin_regions(cfg, n);
    let total = regions.len();

    let mut next = n;
    let delete = Event::DeleteNodes(Box::new(move |tick: u64| {
        if next <= keep {
            return ControlFlow::Break(());
        }
        if tick % MEMBERSHIP_INTERVAL != 0 {
            return ControlFlow::Continue(None);
        }
        next -= 1;
        ControlFlow::Continue(Some(next + 1))
    }));

    Scenario {
        name: "delete-nodes",
        stores: stores(cfg, 1..=n),
        regions,
        events: vec![delete],
        split: SplitPolicy::default(),
        checker: Box::new(balanced_checker(keep as usize, total)),
        analyze_transfers: false,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}
