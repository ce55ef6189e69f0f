use std::ops::ControlFlow;

use drift_sched::scheduler::{StoreId, MIB};

use super::{stores, CheckContext, Layout, Scenario};
use crate::config::SimConfig;
use crate::event::Event;
use crate::raft::SplitPolicy;

const STORES: u64 = 4;
const REGIONS: usize = 400;
const DOWN_STORE: StoreId = 1;
const DOWN_TICK: u64 = 300;

/// Four stores with three replicas per region; store 1 dies mid-run and
/// its replicas have to be rebuilt on the survivors.
pub(super) fn makeup_down_replicas(cfg: &SimConfig) -> Scenario {
    let layout = Layout::random(
        &SimConfig {
            store_num: STORES as usize,
            ..cfg.clone()
        },
        REGIONS,
    );
    let regions = (0..REGIONS)
        .map(|i| {
            let hosts: Vec<StoreId> = (0..3).map(|j| (i as u64 + j) % STORES + 1).collect();
            layout.region(i, &hosts, hosts[0], 96 * MIB, 960_000)
        })
        .collect();

    let mut down = false;
    let delete = Event::DeleteNodes(Box::new(move |tick: u64| {
        if down {
            return ControlFlow::Break(());
        }
        if tick < DOWN_TICK {
            return ControlFlow::Continue(None);
        }
        down = true;
        ControlFlow::Continue(Some(DOWN_STORE))
    }));

    let replicas = REGIONS * 3;
    let mut reported = false;
    Scenario {
        name: "makeup-down-replicas",
        stores: stores(cfg, 1..=STORES),
        regions,
        events: vec![delete],
        split: SplitPolicy::default(),
        checker: Box::new(move |ctx: &CheckContext<'_>| {
            let counts: Vec<usize> = ctx
                .stores
                .iter()
                .map(|s| ctx.regions.region_count(s.store_id))
                .collect();
            let sum: usize = counts.iter().sum();
            if sum < replicas {
                if !reported {
                    tracing::error!(tick = ctx.tick, sum, expected = replicas, "replicas missing");
                    reported = true;
                }
                return false;
            }
            ctx.stores.len() == (STORES - 1) as usize && counts.iter().all(|c| *c == REGIONS)
        }),
        analyze_transfers: false,
        store_num: STORES as usize,
        region_num: REGIONS,
    }
}
