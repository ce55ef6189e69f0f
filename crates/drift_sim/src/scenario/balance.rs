use std::collections::BTreeMap;

use drift_sched::scheduler::{Store, StoreId, GIB, MIB};

use super::{balance_region_count, is_uniform, stores, CheckContext, Layout, Scenario};
use crate::config::SimConfig;
use crate::raft::SplitPolicy;

/// Ticks a store's free space must stay put before the cluster counts as
/// settled.
const SETTLE_TICKS: u64 = 60;

/// Every leader starts on the last store; followers are spread over the
/// others.
pub(super) fn balance_leader(cfg: &SimConfig) -> Scenario {
    let n = cfg.store_num as u64;
    let count = balance_region_count(cfg);
    let layout = Layout::random(cfg, count);
    let regions = (0..count)
        .map(|i| {
            let i = i as u64;
            let hosts = [n, (i + 1) % (n - 1) + 1, (i + 2) % (n - 1) + 1];
            layout.region(i as usize, &hosts, n, 96 * MIB, 960_000)
        })
        .collect();

    let mean = cfg.region_num as f64 / 3.0;
    Scenario {
        name: "balance-leader",
        stores: stores(cfg, 1..=n),
        regions,
        events: Vec::new(),
        split: SplitPolicy::default(),
        checker: Box::new(move |ctx: &CheckContext<'_>| {
            ctx.stores.iter().all(|s| {
                let leaders = ctx.regions.leader_count(s.store_id);
                tracing::debug!(tick = ctx.tick, store_id = s.store_id, leaders, "leader count");
                is_uniform(leaders, mean)
            })
        }),
        analyze_transfers: false,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}

/// Stores alternate between 1TB and 980GB; the run ends once free space has
/// been stable everywhere for a while. Peer moves feed the transfer
/// analyzer.
pub(super) fn redundant_balance_region(cfg: &SimConfig) -> Scenario {
    let n = cfg.store_num as u64;
    let stores: Vec<Store> = (1..=n)
        .map(|id| {
            let capacity = if id % 2 == 1 { 1024 * GIB } else { 980 * GIB };
            Store::new(id, capacity, capacity)
        })
        .collect();

    let count = balance_region_count(cfg);
    let layout = Layout::random(cfg, count);
    let regions = (0..count)
        .map(|i| {
            let hosts: Vec<StoreId> = (0..3).map(|j| (i as u64 + j) % n + 1).collect();
            layout.region(i, &hosts, hosts[0], 96 * MIB, 960_000)
        })
        .collect();

    // store -> (last available, tick it was first seen)
    let mut seen: BTreeMap<StoreId, (u64, u64)> = BTreeMap::new();
    Scenario {
        name: "redundant-balance-region",
        stores,
        regions,
        events: Vec::new(),
        split: SplitPolicy::default(),
        checker: Box::new(move |ctx: &CheckContext<'_>| {
            let mut settled = true;
            for s in ctx.stores {
                let entry = seen.entry(s.store_id).or_insert((s.available, ctx.tick));
                if entry.0 != s.available {
                    *entry = (s.available, ctx.tick);
                }
                if ctx.tick - entry.1 < SETTLE_TICKS || s.to_compaction_size > 0 {
                    settled = false;
                }
            }
            settled
        }),
        analyze_transfers: true,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}
