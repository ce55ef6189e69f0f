use std::collections::BTreeMap;

use drift_sched::scheduler::MIB;

use super::{balance_region_count, is_uniform, stores, CheckContext, Layout, Scenario};
use crate::config::SimConfig;
use crate::event::Event;
use crate::keys;
use crate::raft::SplitPolicy;

const HOT_SPOT_KEY: &[u8] = b"foobar";
const IMPORT_STORES: u64 = 10;
const IMPORT_TABLES: usize = 10;
const IMPORT_REGIONS: usize = 40;
/// Largest share of all replicas a single store may hold after an import.
const IMPORT_MAX_SHARE: f64 = 0.138;

/// One small region on store 1 under a steady write burst on one key.
pub(super) fn region_split(cfg: &SimConfig) -> Scenario {
    let n = cfg.store_num as u64;
    let layout = Layout::random(cfg, 1);
    let regions = vec![layout.region(0, &[1], 1, MIB, 10_000)];
    let write = Event::WriteFlowOnSpot(Box::new(|_: u64| {
        BTreeMap::from([(HOT_SPOT_KEY.to_vec(), 8 * MIB)])
    }));

    Scenario {
        name: "region-split",
        stores: stores(cfg, 1..=n),
        regions,
        events: vec![write],
        split: SplitPolicy {
            size: 128 * MIB,
            keys: 10_000,
            encoded_keys: false,
        },
        checker: Box::new(|ctx: &CheckContext<'_>| {
            ctx.stores.iter().all(|s| {
                let count = ctx.regions.region_count(s.store_id);
                tracing::debug!(tick = ctx.tick, store_id = s.store_id, count, "region count");
                count > 5
            })
        }),
        analyze_transfers: false,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}

/// Many small regions that should merge down to about a quarter of their
/// number.
pub(super) fn region_merge(cfg: &SimConfig) -> Scenario {
    let n = cfg.store_num as u64;
    let count = balance_region_count(cfg);
    let layout = Layout::random(cfg, count);
    let regions = (0..count)
        .map(|i| {
            let hosts: Vec<u64> = (0..3).map(|j| (i as u64 + j) % n + 1).collect();
            layout.region(i, &hosts, hosts[0], 10 * MIB, 100_000)
        })
        .collect();

    // Replicas once three quarters of the regions merged away.
    let target = (count * 3) as f64 / 4.0;
    Scenario {
        name: "region-merge",
        stores: stores(cfg, 1..=n),
        regions,
        events: Vec::new(),
        split: SplitPolicy::default(),
        checker: Box::new(move |ctx: &CheckContext<'_>| {
            let replicas: usize = ctx
                .stores
                .iter()
                .map(|s| ctx.regions.region_count(s.store_id))
                .sum();
            tracing::debug!(tick = ctx.tick, replicas, regions = ctx.regions.len(), "merge progress");
            is_uniform(replicas, target)
        }),
        analyze_transfers: false,
        store_num: cfg.store_num,
        region_num: cfg.region_num,
    }
}

/// Table-keyed regions crowded on three stores while a bulk import writes
/// into a few tables.
pub(super) fn import_data(cfg: &SimConfig) -> Scenario {
    let table_keys = keys::generate_table_keys(IMPORT_TABLES, IMPORT_REGIONS);
    let layout = Layout::with_points(IMPORT_STORES as usize, table_keys[1..].to_vec());
    let regions = (0..IMPORT_REGIONS)
        .map(|i| layout.region(i, &[1, 2, 3], i as u64 % 3 + 1, 32 * MIB, 320_000))
        .collect();

    let write = Event::WriteFlowOnSpot(Box::new(|tick: u64| {
        let table = |t| keys::generate_table_key(t, 0);
        if tick < 100 {
            BTreeMap::from([(table(3), 4 * MIB), (table(5), 32 * MIB)])
        } else {
            BTreeMap::from([(table(2), 2 * MIB), (table(3), 4 * MIB), (table(5), 16 * MIB)])
        }
    }));

    Scenario {
        name: "import-data",
        stores: stores(cfg, 1..=IMPORT_STORES),
        regions,
        events: vec![write],
        split: SplitPolicy {
            size: 64 * MIB,
            keys: 640_000,
            encoded_keys: true,
        },
        checker: Box::new(|ctx: &CheckContext<'_>| {
            let counts: Vec<usize> = ctx
                .stores
                .iter()
                .map(|s| ctx.regions.region_count(s.store_id))
                .collect();
            let total: usize = counts.iter().sum();
            if total == 0 {
                return false;
            }
            counts
                .iter()
                .all(|c| *c as f64 / total as f64 <= IMPORT_MAX_SHARE)
        }),
        analyze_transfers: false,
        store_num: IMPORT_STORES as usize,
        region_num: IMPORT_REGIONS,
    }
}
