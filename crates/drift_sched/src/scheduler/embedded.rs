//! In-process scheduler implementing [`SchedulerClient`].
//!
//! Every store gets its own [`EmbeddedClient`] with a private response
//! stream; decisions for a region are pushed to the stream of the store that
//! reported it. Planning runs inline with each region heartbeat.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::client::{ResponseStream, SchedulerClient, SchedulerConnector};
use super::id_alloc::IdAllocator;
use super::operator::{OpStep, Operator};
use super::planner::{ClusterView, Planner, RegionUpdate};
use super::types::{
    Region, RegionHeartbeatResponse, RegionId, Store, StoreId, StoreStats, MIB,
};

/// Tuning knobs for the embedded scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_replicas: usize,
    pub leader_schedule_limit: usize,
    pub region_schedule_limit: usize,
    pub replica_schedule_limit: usize,
    pub merge_schedule_limit: usize,
    pub hot_region_schedule_limit: usize,
    pub max_merge_region_size: u64,
    pub max_merge_region_keys: u64,
    /// A merged region must stay below the split thresholds.
    pub max_region_size: u64,
    pub max_region_keys: u64,
    /// Heartbeats a region must report without a version change before it
    /// may be merged.
    pub split_merge_heartbeats: u32,
    /// Regions reporting at least this many read or written bytes per tick
    /// are treated as hot.
    pub hot_region_min_bytes: u64,
    /// An operator step dispatched this many times without being applied is
    /// cancelled.
    pub max_dispatches: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_replicas: 3,
            leader_schedule_limit: 64,
            region_schedule_limit: 16,
            replica_schedule_limit: 256,
            merge_schedule_limit: 16,
            hot_region_schedule_limit: 8,
            max_merge_region_size: 20 * MIB,
            max_merge_region_keys: 200_000,
            max_region_size: 144 * MIB,
            max_region_keys: 1_440_000,
            split_merge_heartbeats: 3,
            hot_region_min_bytes: MIB,
            max_dispatches: 16,
        }
    }
}

#[derive(Default)]
struct Inner {
    bootstrapped: bool,
    view: ClusterView,
    operators: BTreeMap<RegionId, Operator>,
    streams: HashMap<StoreId, mpsc::UnboundedSender<RegionHeartbeatResponse>>,
}

struct Shared {
    cfg: SchedulerConfig,
    ids: IdAllocator,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking planner must not wedge every node.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to an in-memory scheduler. Cloning shares the same instance.
#[derive(Clone)]
pub struct EmbeddedScheduler {
    shared: Arc<Shared>,
}

impl EmbeddedScheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                ids: IdAllocator::new(),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.cfg
    }

    /// Creates the client for `store_id`, replacing any earlier stream.
    pub fn client(&self, store_id: StoreId) -> EmbeddedClient {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().streams.insert(store_id, tx);
        EmbeddedClient {
            store_id,
            shared: self.shared.clone(),
            stream: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of operators currently in flight.
    pub fn pending_operators(&self) -> usize {
        self.shared.lock().operators.len()
    }

    /// Regions known to the scheduler.
    pub fn region_count(&self) -> usize {
        self.shared.lock().view.regions.len()
    }
}

impl SchedulerConnector for EmbeddedScheduler {
    fn connect(&self, store_id: StoreId) -> anyhow::Result<Arc<dyn SchedulerClient>> {
        Ok(Arc::new(self.client(store_id)))
    }
}

/// Per-store client of an [`EmbeddedScheduler`].
pub struct EmbeddedClient {
    store_id: StoreId,
    shared: Arc<Shared>,
    stream: Mutex<Option<ResponseStream>>,
    closed: AtomicBool,
}

impl EmbeddedClient {
    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("scheduler client for store {} is closed", self.store_id);
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerClient for EmbeddedClient {
    async fn bootstrap(&self, store: Store, region: Region) -> anyhow::Result<()> {
        self.ensure_open()?;
        let mut inner = self.shared.lock();
        if inner.bootstrapped {
            anyhow::bail!("cluster is already bootstrapped");
        }
        anyhow::ensure!(
            region.leader_store_id() == Some(store.id),
            "bootstrap region {} is not led by store {}",
            region.id,
            store.id
        );
        tracing::info!(store_id = store.id, region_id = region.id, "cluster bootstrapped");
        inner.bootstrapped = true;
        inner.view.put_store(store);
        Ok(())
    }

    async fn put_store(&self, store: Store) -> anyhow::Result<()> {
        self.ensure_open()?;
        let mut inner = self.shared.lock();
        if !inner.bootstrapped {
            anyhow::bail!("put store {} before bootstrap", store.id);
        }
        tracing::debug!(store_id = store.id, "store registered");
        inner.view.put_store(store);
        Ok(())
    }

    async fn store_heartbeat(&self, stats: StoreStats) -> anyhow::Result<()> {
        self.ensure_open()?;
        let store_id = stats.store_id;
        if !self.shared.lock().view.update_stats(stats) {
            anyhow::bail!("store {store_id} is not registered");
        }
        Ok(())
    }

    async fn region_heartbeat(&self, region: Region) -> anyhow::Result<()> {
        self.ensure_open()?;
        let shared = &self.shared;
        let mut inner = shared.lock();
        let Some(resp) = handle_region_heartbeat(&mut inner, shared, self.store_id, region) else {
            return Ok(());
        };
        if let Some(tx) = inner.streams.get(&self.store_id) {
            // A dropped receiver means the node is stopping.
            let _ = tx.send(resp);
        }
        Ok(())
    }

    fn take_response_stream(&self) -> Option<ResponseStream> {
        self.stream.lock().ok()?.take()
    }

    async fn alloc_id(&self) -> anyhow::Result<u64> {
        self.ensure_open()?;
        Ok(self.shared.ids.alloc())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.shared.lock();
        inner.streams.remove(&self.store_id);
        inner.view.disconnect(self.store_id);
        tracing::debug!(store_id = self.store_id, "scheduler client closed");
    }
}

fn handle_region_heartbeat(
    inner: &mut Inner,
    shared: &Shared,
    store_id: StoreId,
    region: Region,
) -> Option<RegionHeartbeatResponse> {
    if region.leader_store_id() != Some(store_id) {
        tracing::debug!(
            store_id,
            region_id = region.id,
            "ignoring heartbeat from non-leader"
        );
        return None;
    }

    match inner.view.update_region(region.clone()) {
        RegionUpdate::Stale => {
            tracing::debug!(region_id = region.id, "ignoring stale region heartbeat");
            return None;
        }
        RegionUpdate::Applied { displaced } => {
            for id in displaced {
                if let Some(op) = inner.operators.remove(&id) {
                    tracing::debug!(region_id = id, desc = op.desc, "operator ended with region");
                }
            }
        }
    }

    if let Some(op) = inner.operators.get_mut(&region.id) {
        match op.advance(&region).cloned() {
            None => {
                tracing::debug!(region_id = region.id, desc = op.desc, "operator finished");
                inner.operators.remove(&region.id);
            }
            Some(step) => {
                if op.dispatches >= shared.cfg.max_dispatches {
                    tracing::warn!(
                        region_id = region.id,
                        desc = op.desc,
                        step = ?step,
                        "operator cancelled after repeated dispatches"
                    );
                    inner.operators.remove(&region.id);
                    return None;
                }
                op.dispatches += 1;
                return dispatch(&inner.view, &step, &region);
            }
        }
    }

    let planner = Planner {
        view: &inner.view,
        operators: &inner.operators,
        cfg: &shared.cfg,
        ids: &shared.ids,
    };
    let mut op = planner.plan(&region)?;
    let step = op.advance(&region)?.clone();
    op.dispatches = 1;
    tracing::debug!(region_id = region.id, desc = op.desc, "operator created");
    let resp = dispatch(&inner.view, &step, &region);
    inner.operators.insert(region.id, op);
    resp
}

fn dispatch(view: &ClusterView, step: &OpStep, region: &Region) -> Option<RegionHeartbeatResponse> {
    let target = match step {
        OpStep::Merge { target } => view.region(*target),
        _ => None,
    };
    step.to_response(region, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::{ConfChangeType, Operation, Peer, RegionEpoch, GIB};

    fn store(id: StoreId) -> Store {
        Store::new(id, 1024 * GIB, 1024 * GIB)
    }

    fn region(id: RegionId, stores: &[StoreId], leader: StoreId) -> Region {
        let peers: Vec<Peer> = stores.iter().map(|s| Peer::voter(id * 10 + s, *s)).collect();
        let leader = peers.iter().copied().find(|p| p.store_id == leader);
        Region {
            id,
            epoch: RegionEpoch::new(1, 1),
            peers,
            leader,
            approximate_size: 96 * MIB,
            approximate_keys: 960_000,
            ..Region::default()
        }
    }

    async fn cluster(stores: &[StoreId]) -> (EmbeddedScheduler, Vec<EmbeddedClient>) {
        let sched = EmbeddedScheduler::new(SchedulerConfig::default());
        let clients: Vec<_> = stores.iter().map(|id| sched.client(*id)).collect();
        clients[0]
            .bootstrap(store(stores[0]), region(1, &[stores[0]], stores[0]))
            .await
            .expect("bootstrap");
        for (client, id) in clients.iter().zip(stores) {
            client.put_store(store(*id)).await.expect("put store");
        }
        (sched, clients)
    }

    #[tokio::test]
    async fn second_bootstrap_is_rejected() {
        let (_sched, clients) = cluster(&[1, 2, 3]).await;
        let err = clients[1]
            .bootstrap(store(2), region(1, &[2], 2))
            .await
            .expect_err("double bootstrap");
        assert!(err.to_string().contains("already bootstrapped"));
    }

    #[tokio::test]
    async fn under_replicated_region_gets_add_peer() {
        let (_sched, clients) = cluster(&[1, 2, 3]).await;
        let mut stream = clients[0].take_response_stream().expect("stream");
        assert!(clients[0].take_response_stream().is_none());

        clients[0]
            .region_heartbeat(region(5, &[1], 1))
            .await
            .expect("heartbeat");
        let resp = stream.try_recv().expect("response");
        assert_eq!(resp.region_id, 5);
        match resp.operation {
            Operation::ChangePeer { change_type, peer } => {
                assert_eq!(change_type, ConfChangeType::AddNode);
                assert_eq!(peer.store_id, 2);
            }
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_from_follower_is_ignored() {
        let (sched, clients) = cluster(&[1, 2, 3]).await;
        let mut stream = clients[1].take_response_stream().expect("stream");
        clients[1]
            .region_heartbeat(region(5, &[1], 1))
            .await
            .expect("heartbeat");
        assert!(stream.try_recv().is_err());
        assert_eq!(sched.region_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_calls() {
        let (_sched, clients) = cluster(&[1, 2, 3]).await;
        clients[2].close().await;
        clients[2].close().await;
        assert!(clients[2].alloc_id().await.is_err());
        assert!(clients[0].alloc_id().await.is_ok());
    }

    #[tokio::test]
    async fn ids_are_shared_across_clients() {
        let (_sched, clients) = cluster(&[1, 2, 3]).await;
        let a = clients[0].alloc_id().await.expect("id");
        let b = clients[1].alloc_id().await.expect("id");
        assert!(b > a);
    }
}
