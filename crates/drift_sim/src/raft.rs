//! The simulator's authoritative region state machine.
//!
//! Every region mutation goes through [`RaftEngine`]. Published mutations are
//! queued per member store so the store's leader can heartbeat them out of
//! band; the periodic heartbeat catches everything else.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::Context;
use drift_sched::scheduler::{Peer, Region, RegionId, StoreId, MIB};

use crate::cluster::Connection;
use crate::keys;
use crate::region_store::RegionStore;
use crate::stats::SchedulerStats;

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("no region to bootstrap from")]
    NoRegions,
    #[error("region {region_id} has no leader on a known store")]
    NoLeader { region_id: RegionId },
}

/// When a region is split and how its split key is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitPolicy {
    /// Split once the approximate size reaches this; 0 disables.
    pub size: u64,
    /// Split once the approximate key count reaches this; 0 disables.
    pub keys: u64,
    /// Region bounds are memcomparable-encoded table keys.
    pub encoded_keys: bool,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            size: 144 * MIB,
            keys: 1_440_000,
            encoded_keys: false,
        }
    }
}

impl SplitPolicy {
    fn should_split(&self, region: &Region) -> bool {
        (self.size > 0 && region.approximate_size >= self.size)
            || (self.keys > 0 && region.approximate_keys >= self.keys)
    }
}

pub struct RaftEngine {
    regions: RegionStore,
    conn: Weak<Connection>,
    changes: Mutex<BTreeMap<StoreId, BTreeSet<RegionId>>>,
    split: SplitPolicy,
    stats: Mutex<SchedulerStats>,
    rpc_timeout: Duration,
}

impl RaftEngine {
    /// Loads the initial regions. Nothing is published for them; the first
    /// periodic heartbeat reports them.
    pub fn new(
        initial: Vec<Region>,
        split: SplitPolicy,
        conn: &Arc<Connection>,
        rpc_timeout: Duration,
    ) -> Self {
        let regions = RegionStore::new();
        for region in initial {
            regions.set(region);
        }
        Self {
            regions,
            conn: Arc::downgrade(conn),
            changes: Mutex::new(BTreeMap::new()),
            split,
            stats: Mutex::new(SchedulerStats::default()),
            rpc_timeout,
        }
    }

    pub fn regions(&self) -> &RegionStore {
        &self.regions
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    pub fn get_region(&self, region_id: RegionId) -> Option<Region> {
        self.regions.get(region_id)
    }

    pub fn search_region(&self, key: &[u8]) -> Option<Region> {
        self.regions.search(key)
    }

    fn changes(&self) -> MutexGuard<'_, BTreeMap<StoreId, BTreeSet<RegionId>>> {
        self.changes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues `region` for each member store that is still connected.
    fn publish(&self, region: &Region) {
        let Some(conn) = self.connection() else {
            return;
        };
        let mut changes = self.changes();
        for peer in region.peers.iter().filter(|p| conn.contains(p.store_id)) {
            changes.entry(peer.store_id).or_default().insert(region.id);
        }
    }

    /// Writes `region` and queues it for every connected member store.
    pub fn set_region(&self, region: Region) {
        self.publish(&region);
        let displaced = self.regions.set(region);
        for old in displaced {
            tracing::debug!(region_id = old.id, "region displaced");
        }
    }

    /// Writes several regions atomically and queues each of them.
    pub fn set_regions(&self, regions: Vec<Region>) {
        for region in &regions {
            self.publish(region);
        }
        self.regions.set_all(regions);
    }

    /// Regions queued for `store_id` since their last report.
    pub fn region_changes(&self, store_id: StoreId) -> Vec<RegionId> {
        self.changes()
            .get(&store_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn reset_region_change(&self, store_id: StoreId, region_id: RegionId) {
        let mut changes = self.changes();
        if let Some(set) = changes.get_mut(&store_id) {
            set.remove(&region_id);
            if set.is_empty() {
                changes.remove(&store_id);
            }
        }
    }

    /// Adds `bytes` written to `region_id` during this tick.
    pub fn update_region_store(&self, region_id: RegionId, bytes: u64) {
        let Some(region) = self.regions.update(region_id, |r| {
            r.approximate_size += bytes;
            r.written_bytes = bytes;
        }) else {
            return;
        };
        let Some(conn) = self.connection() else {
            return;
        };
        for peer in &region.peers {
            if let Some(node) = conn.get(peer.store_id) {
                node.grow_used(bytes);
            }
        }
    }

    /// Records per-region bytes read during this tick.
    pub fn update_region_read_bytes(&self, reads: &BTreeMap<RegionId, u64>) {
        for (region_id, bytes) in reads {
            self.regions.update(*region_id, |r| r.read_bytes = *bytes);
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn with_stats(&self, f: impl FnOnce(&mut SchedulerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// Largest region or peer id in use.
    pub fn max_id(&self) -> u64 {
        self.regions
            .regions()
            .iter()
            .flat_map(|r| std::iter::once(r.id).chain(r.peers.iter().map(|p| p.id)))
            .max()
            .unwrap_or(0)
    }

    /// The region the cluster is bootstrapped with: the first region in key
    /// order, reduced to its leader and an empty range.
    pub fn bootstrap_region(&self) -> Result<Region, RaftError> {
        let mut region = self
            .regions
            .scan(b"", b"", 1)
            .pop()
            .ok_or(RaftError::NoRegions)?;
        let leader = region
            .leader
            .filter(|l| self.connection().is_some_and(|c| c.contains(l.store_id)))
            .ok_or(RaftError::NoLeader {
                region_id: region.id,
            })?;
        region.start_key.clear();
        region.end_key.clear();
        region.peers = vec![leader];
        Ok(region)
    }

    fn is_healthy(&self, store_id: StoreId) -> bool {
        self.connection()
            .and_then(|c| c.get(store_id))
            .is_some_and(|n| n.is_up())
    }

    /// Runs the leader and split steps over every region.
    pub async fn step(&self) -> anyhow::Result<()> {
        for region in self.regions.regions() {
            let region = self.step_leader(region);
            if self.split.should_split(&region) {
                self.split_region(region).await?;
            }
        }
        Ok(())
    }

    fn step_leader(&self, mut region: Region) -> Region {
        if region
            .leader_store_id()
            .is_some_and(|store_id| self.is_healthy(store_id))
        {
            return region;
        }
        let unhealthy = region
            .peers
            .iter()
            .filter(|p| !self.is_healthy(p.store_id))
            .count();
        let elected = if unhealthy * 2 > region.peers.len() {
            None
        } else {
            region
                .voters()
                .filter(|p| self.is_healthy(p.store_id))
                .min_by_key(|p| p.store_id)
                .copied()
        };
        if elected == region.leader {
            return region;
        }
        tracing::debug!(
            region_id = region.id,
            leader = ?elected.map(|p| p.store_id),
            "leader elected"
        );
        region.leader = elected;
        self.set_region(region.clone());
        region
    }

    async fn alloc_id(&self, store_id: StoreId) -> anyhow::Result<u64> {
        let node = self
            .connection()
            .and_then(|c| c.get(store_id))
            .with_context(|| format!("store {store_id} is not connected"))?;
        match tokio::time::timeout(self.rpc_timeout, node.client().alloc_id()).await {
            Ok(res) => res,
            Err(_) => anyhow::bail!("alloc id timed out after {:?}", self.rpc_timeout),
        }
    }

    async fn split_region(&self, region: Region) -> anyhow::Result<()> {
        let Some(leader_store) = region.leader_store_id() else {
            return Ok(());
        };
        let split_key = if self.split.encoded_keys {
            keys::generate_encoded_split_key(&region.start_key, &region.end_key)
                .with_context(|| format!("split key for region {}", region.id))?
        } else {
            keys::generate_split_key(&region.start_key, &region.end_key)
                .with_context(|| format!("split key for region {}", region.id))?
        };
        if split_key <= region.start_key || !region.contains_key(&split_key) {
            tracing::debug!(region_id = region.id, "no split key inside region");
            return Ok(());
        }

        // One id for the new region, one per peer.
        let mut ids = Vec::with_capacity(region.peers.len() + 1);
        for _ in 0..=region.peers.len() {
            match self.alloc_id(leader_store).await {
                Ok(id) => ids.push(id),
                Err(err) => {
                    tracing::info!(region_id = region.id, error = ?err, "split skipped");
                    return Ok(());
                }
            }
        }

        let mut left = region.clone();
        left.id = ids[0];
        left.end_key = split_key.clone();
        left.peers = region
            .peers
            .iter()
            .zip(&ids[1..])
            .map(|(p, id)| Peer { id: *id, ..*p })
            .collect();
        left.leader = region
            .leader
            .and_then(|l| left.peers.iter().find(|p| p.store_id == l.store_id).copied());
        left.epoch.version += 1;
        left.approximate_size = region.approximate_size / 2;
        left.approximate_keys = region.approximate_keys / 2;
        left.down_peers.clear();
        left.pending_peers.clear();

        let mut right = region;
        right.start_key = split_key;
        right.epoch.version += 1;
        right.approximate_size -= left.approximate_size;
        right.approximate_keys -= left.approximate_keys;

        tracing::debug!(
            region_id = right.id,
            new_region_id = left.id,
            size = right.approximate_size,
            "region split"
        );
        self.set_regions(vec![left, right]);
        self.with_stats(|s| s.splits += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use drift_sched::scheduler::{
        EmbeddedScheduler, RegionEpoch, SchedulerClient, SchedulerConfig, Store, GIB,
    };

    use super::*;
    use crate::node::{Node, NodeOptions};

    fn region(id: RegionId, start: &[u8], end: &[u8], stores: &[StoreId]) -> Region {
        let peers: Vec<Peer> = stores.iter().map(|s| Peer::voter(id * 10 + s, *s)).collect();
        Region {
            id,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            epoch: RegionEpoch::new(1, 1),
            leader: peers.first().copied(),
            peers,
            approximate_size: 10 * MIB,
            approximate_keys: 1000,
            ..Region::default()
        }
    }

    fn opts() -> NodeOptions {
        NodeOptions {
            io_rate: 40 * MIB,
            rpc_timeout: Duration::from_secs(1),
            capacity: GIB,
            available: GIB,
        }
    }

    fn add_node(
        conn: &Connection,
        raft: &Arc<RaftEngine>,
        sched: &EmbeddedScheduler,
        store_id: StoreId,
    ) -> Arc<Node> {
        let store = Store::new(store_id, GIB, GIB);
        let client = Arc::new(sched.client(store_id));
        let node = Arc::new(Node::new(store, client, raft.clone(), opts(), None));
        conn.insert(node.clone());
        node
    }

    /// Engine over `regions` with a started node per store in `stores`.
    async fn engine(
        regions: Vec<Region>,
        split: SplitPolicy,
        stores: &[StoreId],
    ) -> (Arc<Connection>, Arc<RaftEngine>) {
        let conn = Connection::new();
        let raft = Arc::new(RaftEngine::new(regions, split, &conn, Duration::from_secs(1)));
        let sched = EmbeddedScheduler::new(SchedulerConfig::default());
        for store_id in stores {
            add_node(&conn, &raft, &sched, *store_id);
        }

        let boot = raft.bootstrap_region().unwrap();
        let leader = conn.get(boot.leader_store_id().unwrap()).unwrap();
        leader.client().bootstrap(leader.store(), boot).await.unwrap();
        for node in conn.nodes() {
            node.start().await.unwrap();
        }
        while leader.client().alloc_id().await.unwrap() <= raft.max_id() {}
        (conn, raft)
    }

    #[tokio::test]
    async fn split_halves_share_the_range() {
        let split = SplitPolicy {
            size: 8 * MIB,
            ..SplitPolicy::default()
        };
        let (conn, raft) = engine(vec![region(1, b"", b"", &[1, 2, 3])], split, &[1, 2, 3]).await;

        raft.step().await.unwrap();

        assert_eq!(raft.regions().len(), 2);
        let right = raft.get_region(1).unwrap();
        let left = raft
            .regions()
            .regions()
            .into_iter()
            .find(|r| r.id != 1)
            .unwrap();
        assert!(left.start_key.is_empty());
        assert_eq!(left.end_key, right.start_key);
        assert!(right.end_key.is_empty());
        assert_eq!(left.epoch.version, 2);
        assert_eq!(right.epoch.version, 2);
        assert_eq!(left.approximate_size + right.approximate_size, 10 * MIB);
        assert_eq!(left.approximate_keys + right.approximate_keys, 1000);
        assert_eq!(left.leader_store_id(), Some(1));
        assert_eq!(left.store_ids(), right.store_ids());
        assert!(left.peers.iter().all(|p| right.peer(p.id).is_none()));
        assert_eq!(raft.stats().splits, 1);
        assert_eq!(raft.region_changes(2), {
            let mut ids = vec![1, left.id];
            ids.sort_unstable();
            ids
        });
        for node in conn.nodes() {
            node.stop().await;
        }
    }

    #[tokio::test]
    async fn leader_moves_off_a_stopped_store() {
        let regions = vec![
            region(1, b"", b"m", &[2, 1, 3]),
            region(2, b"m", b"", &[2, 4]),
        ];
        let (conn, raft) = engine(regions, SplitPolicy::default(), &[1, 2, 3]).await;
        let stopped = conn.remove(2).unwrap();
        stopped.stop().await;

        raft.step().await.unwrap();

        // Two of three peers healthy: the lowest healthy store wins.
        assert_eq!(raft.get_region(1).unwrap().leader_store_id(), Some(1));
        // Store 4 never joined: no quorum, no leader.
        assert_eq!(raft.get_region(2).unwrap().leader, None);
        assert!(raft.region_changes(1).contains(&1));
        for node in conn.nodes() {
            node.stop().await;
        }
    }

    #[tokio::test]
    async fn writes_grow_every_replica() {
        let (conn, raft) = engine(
            vec![region(1, b"", b"", &[1, 2])],
            SplitPolicy::default(),
            &[1, 2],
        )
        .await;
        let before = conn.get(2).unwrap().usage().used;
        raft.update_region_store(1, 3 * MIB);
        raft.update_region_read_bytes(&BTreeMap::from([(1, 5 * MIB), (99, MIB)]));

        let region = raft.get_region(1).unwrap();
        assert_eq!(region.approximate_size, 13 * MIB);
        assert_eq!(region.written_bytes, 3 * MIB);
        assert_eq!(region.read_bytes, 5 * MIB);
        assert_eq!(conn.get(2).unwrap().usage().used, before + 3 * MIB);
        for node in conn.nodes() {
            node.stop().await;
        }
    }

    #[test]
    fn bootstrap_region_is_reduced_to_its_leader() {
        let conn = Connection::new();
        let raft = RaftEngine::new(
            vec![region(4, b"k", b"", &[2, 3]), region(3, b"", b"k", &[1, 2])],
            SplitPolicy::default(),
            &conn,
            Duration::from_secs(1),
        );
        assert!(matches!(
            raft.bootstrap_region(),
            Err(RaftError::NoLeader { region_id: 3 })
        ));

        let empty = RaftEngine::new(Vec::new(), SplitPolicy::default(), &conn, Duration::from_secs(1));
        assert!(matches!(empty.bootstrap_region(), Err(RaftError::NoRegions)));
        assert_eq!(raft.max_id(), 43);
    }

    #[test]
    fn change_queue_tracks_member_stores() {
        let conn = Connection::new();
        let raft = Arc::new(RaftEngine::new(
            Vec::new(),
            SplitPolicy::default(),
            &conn,
            Duration::from_secs(1),
        ));
        let sched = EmbeddedScheduler::new(SchedulerConfig::default());
        for store_id in [1, 2, 3] {
            add_node(&conn, &raft, &sched, store_id);
        }
        raft.set_region(region(5, b"", b"", &[1, 2]));
        assert_eq!(raft.region_changes(1), vec![5]);
        assert_eq!(raft.region_changes(2), vec![5]);
        assert!(raft.region_changes(3).is_empty());
        raft.reset_region_change(1, 5);
        assert!(raft.region_changes(1).is_empty());
        assert_eq!(raft.region_changes(2), vec![5]);
    }

    #[test]
    fn changes_skip_disconnected_stores() {
        let conn = Connection::new();
        let raft = Arc::new(RaftEngine::new(
            Vec::new(),
            SplitPolicy::default(),
            &conn,
            Duration::from_secs(1),
        ));
        let sched = EmbeddedScheduler::new(SchedulerConfig::default());
        add_node(&conn, &raft, &sched, 1);
        add_node(&conn, &raft, &sched, 2);
        conn.remove(2);

        raft.set_region(region(7, b"", b"", &[1, 2]));

        assert_eq!(raft.region_changes(1), vec![7]);
        assert!(raft.region_changes(2).is_empty());
    }

    #[tokio::test]
    async fn unsplittable_range_fails_the_step() {
        let split = SplitPolicy {
            size: MIB,
            ..SplitPolicy::default()
        };
        let (conn, raft) = engine(
            vec![region(1, b"", b"a", &[1]), region(2, b"a", b"a\0", &[1])],
            split,
            &[1],
        )
        .await;

        let err = raft.step().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<keys::KeyError>(),
            Some(&keys::KeyError::EmptyRange)
        );
        for node in conn.nodes() {
            node.stop().await;
        }
    }
}
