//! Node registry and node lifecycle for a running scenario.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use drift_analyzer::TransferCounter;
use drift_sched::scheduler::{PeerStats, SchedulerConnector, Store, StoreId, StoreStats};

use crate::node::{Node, NodeOptions};
use crate::raft::RaftEngine;

/// Down time reported for peers of a deleted store.
pub const DOWN_PEER_SECONDS: u64 = 24 * 60 * 60;

/// Store id to node map. Owned by the driver; the raft engine keeps a weak
/// reference.
#[derive(Default)]
pub struct Connection {
    nodes: RwLock<BTreeMap<StoreId, Arc<Node>>>,
}

impl Connection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<StoreId, Arc<Node>>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<StoreId, Arc<Node>>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, node: Arc<Node>) {
        self.write().insert(node.id(), node);
    }

    pub fn remove(&self, store_id: StoreId) -> Option<Arc<Node>> {
        self.write().remove(&store_id)
    }

    pub fn get(&self, store_id: StoreId) -> Option<Arc<Node>> {
        self.read().get(&store_id).cloned()
    }

    pub fn contains(&self, store_id: StoreId) -> bool {
        self.read().contains_key(&store_id)
    }

    /// Nodes ordered by store id.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Shared handles used to grow and shrink the simulated cluster.
pub struct Cluster {
    conn: Arc<Connection>,
    raft: Arc<RaftEngine>,
    connector: Arc<dyn SchedulerConnector>,
    opts: NodeOptions,
    hook: Option<Arc<TransferCounter>>,
}

impl Cluster {
    pub fn new(
        conn: Arc<Connection>,
        raft: Arc<RaftEngine>,
        connector: Arc<dyn SchedulerConnector>,
        opts: NodeOptions,
        hook: Option<Arc<TransferCounter>>,
    ) -> Self {
        Self {
            conn,
            raft,
            connector,
            opts,
            hook,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn raft(&self) -> &Arc<RaftEngine> {
        &self.raft
    }

    pub fn options(&self) -> &NodeOptions {
        &self.opts
    }

    /// Creates and registers a node without starting it.
    pub fn create_node(&self, store: Store) -> anyhow::Result<Arc<Node>> {
        let store_id = store.id;
        let client = self
            .connector
            .connect(store_id)
            .with_context(|| format!("connect scheduler client for store {store_id}"))?;
        let node = Arc::new(Node::new(
            store,
            client,
            self.raft.clone(),
            self.opts.clone(),
            self.hook.clone(),
        ));
        self.conn.insert(node.clone());
        Ok(node)
    }

    /// Creates, registers and starts a node for a store joining mid-run.
    pub async fn add_node(&self, store_id: StoreId) -> anyhow::Result<()> {
        let store = Store::new(store_id, self.opts.capacity, self.opts.available);
        let node = self.create_node(store)?;
        node.start()
            .await
            .with_context(|| format!("start node {store_id}"))?;
        tracing::info!(store_id, "node added");
        Ok(())
    }

    /// Stops a node and marks every peer it hosted as down.
    pub async fn delete_node(&self, store_id: StoreId) -> anyhow::Result<()> {
        let node = self
            .conn
            .remove(store_id)
            .with_context(|| format!("store {store_id} is not running"))?;
        node.stop().await;
        for mut region in self.raft.regions().store_regions(store_id) {
            let Some(peer) = region.store_peer(store_id).copied() else {
                continue;
            };
            if region.is_down_peer(peer.id) {
                continue;
            }
            region.down_peers.push(PeerStats {
                peer,
                down_seconds: DOWN_PEER_SECONDS,
            });
            self.raft.set_region(region);
        }
        tracing::info!(store_id, "node deleted");
        Ok(())
    }

    /// Stats of every running node, ordered by store id.
    pub fn store_stats(&self) -> Vec<StoreStats> {
        self.conn.nodes().iter().map(|n| n.stats()).collect()
    }

    pub async fn stop_all(&self) {
        for node in self.conn.nodes() {
            node.stop().await;
        }
    }
}
