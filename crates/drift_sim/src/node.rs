//! One simulated store.
//!
//! A node talks to the scheduler through its client, turns streamed
//! scheduling decisions into tasks, and advances those tasks once per tick.
//!
//! Periodic work, on driver rounds counted from 0 so that nodes added
//! mid-run stay in phase with the rest:
//! - every 10 rounds: store heartbeat
//! - every 60 rounds: heartbeat of every region this node leads
//! - every 600 rounds: compaction of space freed by removed peers

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use drift_analyzer::TransferCounter;
use drift_sched::scheduler::{
    Region, RegionHeartbeatResponse, RegionId, ResponseStream, SchedulerClient, Store, StoreId,
    StoreState, StoreStats,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::raft::RaftEngine;
use crate::task::Task;

pub const STORE_HEARTBEAT_TICKS: u64 = 10;
pub const REGION_HEARTBEAT_TICKS: u64 = 60;
pub const COMPACTION_TICKS: u64 = 600;

#[derive(Clone, Debug)]
pub struct NodeOptions {
    /// Snapshot bytes a node can send or receive per tick.
    pub io_rate: u64,
    pub rpc_timeout: Duration,
    /// Capacity and available bytes of stores created mid-run.
    pub capacity: u64,
    pub available: u64,
}

/// Size accounting of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub available: u64,
    pub used: u64,
    pub to_compaction: u64,
    pub sending: u32,
    pub receiving: u32,
}

pub struct Node {
    store: RwLock<Store>,
    client: Arc<dyn SchedulerClient>,
    raft: Arc<RaftEngine>,
    opts: NodeOptions,
    hook: Option<Arc<TransferCounter>>,
    tasks: Mutex<BTreeMap<RegionId, Task>>,
    usage: Mutex<StoreUsage>,
    start_time: u64,
    cancel: CancellationToken,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(
        store: Store,
        client: Arc<dyn SchedulerClient>,
        raft: Arc<RaftEngine>,
        opts: NodeOptions,
        hook: Option<Arc<TransferCounter>>,
    ) -> Self {
        let used: u64 = raft
            .regions()
            .store_regions(store.id)
            .iter()
            .map(|r| r.approximate_size)
            .sum();
        let usage = StoreUsage {
            available: store.available.saturating_sub(used),
            used,
            ..StoreUsage::default()
        };
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            store: RwLock::new(store),
            client,
            raft,
            opts,
            hook,
            tasks: Mutex::new(BTreeMap::new()),
            usage: Mutex::new(usage),
            start_time,
            cancel: CancellationToken::new(),
            receiver: Mutex::new(None),
        }
    }

    pub fn id(&self) -> StoreId {
        self.store().id
    }

    pub fn store(&self) -> Store {
        self.store.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_up(&self) -> bool {
        !self.cancel.is_cancelled() && self.store().state == StoreState::Up
    }

    pub fn client(&self) -> &Arc<dyn SchedulerClient> {
        &self.client
    }

    pub fn raft(&self) -> &Arc<RaftEngine> {
        &self.raft
    }

    pub fn hook(&self) -> Option<&TransferCounter> {
        self.hook.as_deref()
    }

    pub fn io_rate(&self) -> u64 {
        self.opts.io_rate
    }

    fn usage_lock(&self) -> MutexGuard<'_, StoreUsage> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn usage(&self) -> StoreUsage {
        *self.usage_lock()
    }

    /// Applies `f` to the size accounting under its lock.
    pub fn update_usage(&self, f: impl FnOnce(&mut StoreUsage)) {
        f(&mut self.usage_lock());
    }

    pub fn grow_used(&self, bytes: u64) {
        self.update_usage(|u| {
            u.used += bytes;
            u.available = u.available.saturating_sub(bytes);
        });
    }

    /// Queues `bytes` to be freed by the next compaction.
    pub fn add_to_compaction(&self, bytes: u64) {
        self.update_usage(|u| u.to_compaction += bytes);
    }

    pub fn compact(&self) {
        self.update_usage(|u| {
            u.available += u.to_compaction;
            u.used = u.used.saturating_sub(u.to_compaction);
            u.to_compaction = 0;
        });
    }

    pub fn stats(&self) -> StoreStats {
        let store = self.store();
        let usage = self.usage();
        StoreStats {
            store_id: store.id,
            capacity: store.capacity,
            available: usage.available,
            used_size: usage.used,
            to_compaction_size: usage.to_compaction,
            sending_snap_count: usage.sending,
            receiving_snap_count: usage.receiving,
            region_count: self.raft.regions().region_count(store.id) as u64,
            start_time: self.start_time,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Queues `task` unless one is already outstanding for its region.
    pub fn add_task(&self, task: Task) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.entry(task.region_id()) {
            Entry::Occupied(_) => {
                tracing::debug!(
                    store_id = self.id(),
                    region_id = task.region_id(),
                    task = task.desc(),
                    "dropping duplicate task"
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(task);
                true
            }
        }
    }

    async fn call<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.opts.rpc_timeout, fut).await {
            Ok(res) => res,
            Err(_) => anyhow::bail!("{what} timed out after {:?}", self.opts.rpc_timeout),
        }
    }

    /// Registers the store and starts consuming scheduling decisions.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.call("put store", self.client.put_store(self.store()))
            .await?;
        let stream = self
            .client
            .take_response_stream()
            .ok_or_else(|| anyhow::anyhow!("response stream of store {} already taken", self.id()))?;
        let node = self.clone();
        let handle = tokio::spawn(async move { node.receive_responses(stream).await });
        *self.receiver.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .state = StoreState::Up;
        tracing::debug!(store_id = self.id(), "node started");
        Ok(())
    }

    async fn receive_responses(self: Arc<Self>, mut stream: ResponseStream) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                resp = stream.recv() => match resp {
                    Some(resp) => self.handle_response(resp),
                    None => break,
                },
            }
        }
    }

    fn handle_response(&self, resp: RegionHeartbeatResponse) {
        let Some(region) = self.raft.get_region(resp.region_id) else {
            tracing::debug!(region_id = resp.region_id, "response for unknown region");
            return;
        };
        match Task::from_response(&region, resp) {
            Some(task) => {
                self.add_task(task);
            }
            None => tracing::debug!(region_id = region.id, "response needs no task"),
        }
    }

    async fn heartbeat_region(&self, region: Region) {
        let region_id = region.id;
        if let Err(err) = self
            .call("region heartbeat", self.client.region_heartbeat(region))
            .await
        {
            tracing::info!(store_id = self.id(), region_id, error = ?err, "region heartbeat failed");
        }
    }

    async fn store_heartbeat(&self) {
        if let Err(err) = self
            .call("store heartbeat", self.client.store_heartbeat(self.stats()))
            .await
        {
            tracing::info!(store_id = self.id(), error = ?err, "store heartbeat failed");
        }
    }

    /// Heartbeats every queued region change this node leads and clears the
    /// queue entries.
    pub async fn report_region_change(&self) {
        let store_id = self.id();
        for region_id in self.raft.region_changes(store_id) {
            if let Some(region) = self.raft.get_region(region_id) {
                if region.leader_store_id() == Some(store_id) {
                    self.heartbeat_region(region).await;
                }
            }
            self.raft.reset_region_change(store_id, region_id);
        }
    }

    /// Runs driver round `round`: periodic heartbeats and compaction, then
    /// one step of every queued task.
    pub async fn tick(&self, round: u64) {
        if round % STORE_HEARTBEAT_TICKS == 0 {
            self.store_heartbeat().await;
        }
        if round % REGION_HEARTBEAT_TICKS == 0 {
            for region in self.raft.regions().leader_regions(self.id()) {
                self.heartbeat_region(region).await;
            }
        }
        if round % COMPACTION_TICKS == 0 {
            self.compact();
        }
        self.step_tasks();
    }

    fn step_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|_, task| !task.step(self));
    }

    /// Cancels the response consumer, closes the client and waits for the
    /// consumer to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.client.close().await;
        let handle = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(store_id = self.id(), error = ?err, "response consumer failed");
            }
        }
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .state = StoreState::Offline;
    }
}
