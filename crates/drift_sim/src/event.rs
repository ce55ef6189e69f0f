//! Scripted cluster events, run once per driver tick after the raft step.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use anyhow::Context;
use drift_sched::scheduler::{RegionId, StoreId};

use crate::cluster::Cluster;

/// Bytes per key for one tick.
pub type KeyFlow = Box<dyn FnMut(u64) -> BTreeMap<Vec<u8>, u64> + Send>;
/// Bytes per region for one tick.
pub type RegionFlow = Box<dyn FnMut(u64) -> BTreeMap<RegionId, u64> + Send>;
/// Store to add or delete at a tick. `Break` ends the event.
pub type NodeStep = Box<dyn FnMut(u64) -> ControlFlow<(), Option<StoreId>> + Send>;

pub enum Event {
    WriteFlowOnSpot(KeyFlow),
    WriteFlowOnRegion(RegionFlow),
    ReadFlowOnRegion(RegionFlow),
    AddNodes(NodeStep),
    DeleteNodes(NodeStep),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::WriteFlowOnSpot(_) => "write-flow-on-spot",
            Event::WriteFlowOnRegion(_) => "write-flow-on-region",
            Event::ReadFlowOnRegion(_) => "read-flow-on-region",
            Event::AddNodes(_) => "add-nodes",
            Event::DeleteNodes(_) => "delete-nodes",
        }
    }

    /// Applies the event for `tick`. Returns true once the event is done.
    async fn run(&mut self, tick: u64, cluster: &Cluster) -> anyhow::Result<bool> {
        let raft = cluster.raft();
        match self {
            Event::WriteFlowOnSpot(step) => {
                for (key, bytes) in step(tick) {
                    match raft.search_region(&key) {
                        Some(region) => raft.update_region_store(region.id, bytes),
                        None => tracing::debug!(key = ?key, "no region covers written key"),
                    }
                }
                Ok(false)
            }
            Event::WriteFlowOnRegion(step) => {
                for (region_id, bytes) in step(tick) {
                    raft.update_region_store(region_id, bytes);
                }
                Ok(false)
            }
            Event::ReadFlowOnRegion(step) => {
                raft.update_region_read_bytes(&step(tick));
                Ok(false)
            }
            Event::AddNodes(step) => match step(tick) {
                ControlFlow::Break(()) => Ok(true),
                ControlFlow::Continue(None) => Ok(false),
                ControlFlow::Continue(Some(store_id)) => {
                    cluster
                        .add_node(store_id)
                        .await
                        .with_context(|| format!("add node {store_id} at tick {tick}"))?;
                    Ok(false)
                }
            },
            Event::DeleteNodes(step) => match step(tick) {
                ControlFlow::Break(()) => Ok(true),
                ControlFlow::Continue(None) => Ok(false),
                ControlFlow::Continue(Some(store_id)) => {
                    cluster
                        .delete_node(store_id)
                        .await
                        .with_context(|| format!("delete node {store_id} at tick {tick}"))?;
                    Ok(false)
                }
            },
        }
    }
}

/// Live events of a scenario.
#[derive(Default)]
pub struct EventRunner {
    events: Vec<Event>,
}

impl EventRunner {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Runs every live event in order and drops the ones that finished.
    pub async fn tick(&mut self, tick: u64, cluster: &Cluster) -> anyhow::Result<()> {
        let mut i = 0;
        while i < self.events.len() {
            if self.events[i].run(tick, cluster).await? {
                let done = self.events.remove(i);
                tracing::debug!(tick, event = done.kind(), "event finished");
            } else {
                i += 1;
            }
        }
        Ok(())
    }
}
