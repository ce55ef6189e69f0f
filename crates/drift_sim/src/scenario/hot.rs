use std::collections::BTreeMap;

use drift_sched::scheduler::{Region, RegionId, StoreId, MIB};

use super::{balance_region_count, spread, stores, CheckContext, Layout, Scenario};
use crate::config::SimConfig;
use crate::event::Event;
use crate::raft::SplitPolicy;

/// Every region is led by store 1; followers rotate over the other stores.
fn led_by_first_store(cfg: &SimConfig) -> Vec<Region> {
    let n = cfg.store_num as u64;
    let count = balance_region_count(cfg);
    let layout = Layout::random(cfg, count);
    (0..count)
        .map(|i| {
            let i = i as u64;
            let hosts = [1, i % (n - 1) + 2, (i + 1) % (n - 1) + 2];
            layout.region(i as usize, &hosts, 1, 96 * MIB, 960_000)
        })
        .collect()
}

/// Per-store leader and peer counts over the hot regions, including stores
/// that hold none.
fn hot_counts(ctx: &CheckContext<'_>, hot: &[RegionId]) -> (Vec<usize>, Vec<usize>) {
    let mut leaders: BTreeMap<StoreId, usize> = ctx.stores.iter().map(|s| (s.store_id, 0)).collect();
    let mut peers = leaders.clone();
    for region in hot.iter().filter_map(|id| ctx.regions.get(*id)) {
        if let Some(count) = region.leader_store_id().and_then(|s| leaders.get_mut(&s)) {
            *count += 1;
        }
        for store_id in region.store_ids() {
            if let Some(count) = peers.get_mut(&store_id) {
                *count += 1;
            }
        }
    }
    (leaders.into_values().collect(), peers.into_values().collect())
}

pub(super) fn hot_read(cfg: &SimConfig) -> Scenario {
    let regions = led_by_first_store(cfg);
    let hot: Vec<RegionId> = regions
        .iter()
        .take(cfg.store_num * 4)
        .map(|r| r.id)
        .collect();

    let reads = hot.clone();
    let read = Event::ReadFlowOnRegion(Box::new(move |_: u64| {
        reads.iter().map(|id| (*id, 128 * MIB)).collect()
    }));

    Scenario {
        name: "hot-read",
        stores: stores(cfg, 1..=cfg.store_num as u64),
        regions,
        events: vec![read],
        split: SplitPolicy::default(),
        checker: Box::new(move |ctx: &CheckContext<'_>| {
            let (leaders, _) = hot_counts(ctx, &hot);
            tracing::debug!(tick = ctx.tick, ?leaders, "hot read leaders");
            spread(leaders) < 2
        }),
        analyze_transfers: false,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}

pub(super) fn hot_write(cfg: &SimConfig) -> Scenario {
    let regions = led_by_first_store(cfg);
    let hot: Vec<RegionId> = regions.iter().take(cfg.store_num).map(|r| r.id).collect();

    let writes = hot.clone();
    let write = Event::WriteFlowOnRegion(Box::new(move |_: u64| {
        writes.iter().map(|id| (*id, 2 * MIB)).collect()
    }));

    Scenario {
        name: "hot-write",
        stores: stores(cfg, 1..=cfg.store_num as u64),
        regions,
        events: vec![write],
        split: SplitPolicy::default(),
        checker: Box::new(move |ctx: &CheckContext<'_>| {
            let (leaders, peers) = hot_counts(ctx, &hot);
            tracing::debug!(tick = ctx.tick, ?leaders, ?peers, "hot write load");
            spread(leaders) <= 2 && spread(peers) <= 2
        }),
        analyze_transfers: false,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}
