//! Per-region work items created from scheduling decisions.
//!
//! A task is advanced once per tick of the node that owns it and reports
//! whether it finished. Tasks whose region epoch moved past the epoch the
//! decision was made against finish without effect.

use drift_sched::scheduler::{
    ConfChangeType, Operation, Peer, PeerRole, Region, RegionEpoch, RegionHeartbeatResponse,
    RegionId, MIB,
};

use crate::node::Node;

/// Residual work drained per tick by remove, add-learner and merge tasks.
pub const DEFAULT_TASK_SPEED: u64 = 100 * MIB;

/// One side of a snapshot transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotStat {
    pub remaining: u64,
    pub started: bool,
    pub finished: bool,
}

impl SnapshotStat {
    pub fn new(size: u64) -> Self {
        Self {
            remaining: size,
            ..Self::default()
        }
    }

    /// Transfers up to `rate` bytes. Returns true on the step that finishes.
    fn advance(&mut self, rate: u64) -> bool {
        if self.finished {
            return false;
        }
        self.remaining = self.remaining.saturating_sub(rate);
        self.finished = self.remaining == 0;
        self.finished
    }

    fn in_flight(&self) -> bool {
        self.started && !self.finished
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskKind {
    AddPeer {
        peer: Peer,
        send: SnapshotStat,
        recv: SnapshotStat,
    },
    AddLearner {
        peer: Peer,
    },
    PromoteLearner {
        peer: Peer,
    },
    RemovePeer {
        peer: Peer,
    },
    TransferLeader {
        from: Option<Peer>,
        to: Peer,
    },
    MergeRegion {
        target: RegionId,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    region_id: RegionId,
    epoch: RegionEpoch,
    residual: u64,
    speed: u64,
    kind: TaskKind,
}

impl Task {
    pub fn new(region: &Region, epoch: RegionEpoch, kind: TaskKind) -> Self {
        let residual = match kind {
            TaskKind::AddLearner { .. } | TaskKind::RemovePeer { .. } | TaskKind::MergeRegion { .. } => {
                region.approximate_size
            }
            _ => 0,
        };
        Self {
            region_id: region.id,
            epoch,
            residual,
            speed: DEFAULT_TASK_SPEED,
            kind,
        }
    }

    /// Translates a scheduler decision about `region`. Returns `None` when
    /// the decision needs no work.
    pub fn from_response(region: &Region, resp: RegionHeartbeatResponse) -> Option<Self> {
        let kind = match resp.operation {
            Operation::ChangePeer {
                change_type: ConfChangeType::AddNode,
                peer,
            } => match region.store_peer(peer.store_id) {
                Some(existing) if existing.is_learner() => TaskKind::PromoteLearner { peer: *existing },
                Some(_) => return None,
                None => TaskKind::AddPeer {
                    peer: Peer::voter(peer.id, peer.store_id),
                    send: SnapshotStat::new(region.approximate_size),
                    recv: SnapshotStat::new(region.approximate_size),
                },
            },
            Operation::ChangePeer {
                change_type: ConfChangeType::AddLearnerNode,
                peer,
            } => {
                if region.store_peer(peer.store_id).is_some() {
                    return None;
                }
                TaskKind::AddLearner {
                    peer: Peer::learner(peer.id, peer.store_id),
                }
            }
            Operation::ChangePeer {
                change_type: ConfChangeType::RemoveNode,
                peer,
            } => TaskKind::RemovePeer { peer },
            Operation::TransferLeader { peer } => TaskKind::TransferLeader {
                from: region.leader,
                to: peer,
            },
            Operation::Merge { target } => TaskKind::MergeRegion { target: target.id },
        };
        Some(Self::new(region, resp.region_epoch, kind))
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn desc(&self) -> &'static str {
        match self.kind {
            TaskKind::AddPeer { .. } => "add-peer",
            TaskKind::AddLearner { .. } => "add-learner",
            TaskKind::PromoteLearner { .. } => "promote-learner",
            TaskKind::RemovePeer { .. } => "remove-peer",
            TaskKind::TransferLeader { .. } => "transfer-leader",
            TaskKind::MergeRegion { .. } => "merge-region",
        }
    }

    /// Drains one tick of residual work. True while work remains.
    fn working(&mut self) -> bool {
        self.residual = self.residual.saturating_sub(self.speed);
        self.residual > 0
    }

    /// Advances the task on behalf of `node`. Returns true once finished.
    pub fn step(&mut self, node: &Node) -> bool {
        let Some(region) = node.raft().get_region(self.region_id) else {
            self.abort(node);
            return true;
        };
        if region.epoch.is_newer_than(&self.epoch) {
            tracing::debug!(
                store_id = node.id(),
                region_id = self.region_id,
                task = self.desc(),
                "stale task dropped"
            );
            self.abort(node);
            return true;
        }

        match self.kind.clone() {
            TaskKind::AddPeer { peer, .. } => self.step_add_peer(node, region, peer),
            TaskKind::AddLearner { peer } => {
                if self.working() {
                    return false;
                }
                add_learner(node, region, peer);
                true
            }
            TaskKind::PromoteLearner { peer } => {
                promote_learner(node, region, peer);
                true
            }
            TaskKind::RemovePeer { peer } => {
                if self.working() {
                    return false;
                }
                remove_peer(node, region, peer);
                true
            }
            TaskKind::TransferLeader { from, to } => {
                transfer_leader(node, region, from, to);
                true
            }
            TaskKind::MergeRegion { target } => {
                if self.working() {
                    return false;
                }
                merge_region(node, region, target);
                true
            }
        }
    }

    fn step_add_peer(&mut self, node: &Node, mut region: Region, peer: Peer) -> bool {
        let Some(receiver) = node.raft().connection().and_then(|c| c.get(peer.store_id)) else {
            tracing::debug!(region_id = region.id, store_id = peer.store_id, "snapshot target gone");
            self.abort(node);
            return true;
        };
        let TaskKind::AddPeer { send, recv, .. } = &mut self.kind else {
            return true;
        };

        if !send.started {
            send.started = true;
            node.update_usage(|u| u.sending += 1);
        }
        if !recv.started {
            recv.started = true;
            receiver.update_usage(|u| u.receiving += 1);
        }
        if send.advance(node.io_rate()) {
            node.update_usage(|u| u.sending = u.sending.saturating_sub(1));
        }
        if recv.advance(receiver.io_rate()) {
            receiver.update_usage(|u| u.receiving = u.receiving.saturating_sub(1));
        }
        if !(send.finished && recv.finished) {
            return false;
        }

        match region.peers.iter_mut().find(|p| p.store_id == peer.store_id) {
            Some(existing) => existing.role = PeerRole::Voter,
            None => region.peers.push(peer),
        }
        region.epoch.conf_ver += 1;
        let size = region.approximate_size;
        let region_id = region.id;
        node.raft().set_region(region);
        receiver.grow_used(size);
        node.raft().with_stats(|s| {
            s.peers_added += 1;
            s.snapshots_sent += 1;
            s.snapshots_received += 1;
        });
        if let Some(hook) = node.hook() {
            hook.add_target(region_id, peer.store_id);
        }
        tracing::debug!(region_id, store_id = peer.store_id, "peer added");
        true
    }

    /// Releases snapshot counters held by an unfinished transfer.
    fn abort(&mut self, node: &Node) {
        let TaskKind::AddPeer { peer, send, recv } = &mut self.kind else {
            return;
        };
        if send.in_flight() {
            node.update_usage(|u| u.sending = u.sending.saturating_sub(1));
            send.finished = true;
        }
        if recv.in_flight() {
            if let Some(receiver) = node.raft().connection().and_then(|c| c.get(peer.store_id)) {
                receiver.update_usage(|u| u.receiving = u.receiving.saturating_sub(1));
            }
            recv.finished = true;
        }
    }
}

fn add_learner(node: &Node, mut region: Region, peer: Peer) {
    if region.store_peer(peer.store_id).is_some() {
        return;
    }
    region.peers.push(Peer::learner(peer.id, peer.store_id));
    region.epoch.conf_ver += 1;
    let region_id = region.id;
    node.raft().set_region(region);
    node.raft().with_stats(|s| s.learners_added += 1);
    if let Some(hook) = node.hook() {
        hook.add_target(region_id, peer.store_id);
    }
}

fn promote_learner(node: &Node, mut region: Region, peer: Peer) {
    let Some(existing) = region.peers.iter_mut().find(|p| p.id == peer.id) else {
        return;
    };
    if !existing.is_learner() {
        return;
    }
    existing.role = PeerRole::Voter;
    region.epoch.conf_ver += 1;
    node.raft().set_region(region);
    node.raft().with_stats(|s| s.learners_promoted += 1);
}

fn remove_peer(node: &Node, mut region: Region, peer: Peer) {
    let Some(pos) = region.peers.iter().position(|p| p.id == peer.id) else {
        return;
    };
    region.peers.remove(pos);
    if region.leader.is_some_and(|l| l.id == peer.id) {
        region.leader = None;
    }
    let host = node.raft().connection().and_then(|c| c.get(peer.store_id));
    if host.is_none() {
        region.down_peers.retain(|d| d.peer.id != peer.id);
    }
    region.pending_peers.retain(|p| p.id != peer.id);
    region.epoch.conf_ver += 1;
    let size = region.approximate_size;
    let region_id = region.id;
    node.raft().set_region(region);
    if let Some(host) = host {
        host.add_to_compaction(size);
    }
    node.raft().with_stats(|s| s.peers_removed += 1);
    if let Some(hook) = node.hook() {
        if let Err(err) = hook.add_source(region_id, peer.store_id) {
            tracing::error!(error = %err, "transfer hook out of order");
        }
    }
    tracing::debug!(region_id, store_id = peer.store_id, "peer removed");
}

fn transfer_leader(node: &Node, mut region: Region, from: Option<Peer>, to: Peer) {
    let Some(target) = region.peer(to.id).copied() else {
        tracing::debug!(region_id = region.id, peer_id = to.id, "transfer target gone");
        return;
    };
    if target.is_learner() || region.leader == Some(target) {
        return;
    }
    let from_store = region.leader.or(from).map(|p| p.store_id);
    region.leader = Some(target);
    node.raft().set_region(region);
    if let Some(from_store) = from_store {
        node.raft()
            .with_stats(|s| s.record_leader_transfer(from_store, target.store_id));
    }
}

fn merge_region(node: &Node, source: Region, target_id: RegionId) {
    let Some(mut target) = node.raft().get_region(target_id) else {
        tracing::debug!(region_id = source.id, target_id, "merge target gone");
        return;
    };
    let (start_key, end_key) =
        if !source.end_key.is_empty() && source.end_key == target.start_key {
            (source.start_key.clone(), target.end_key.clone())
        } else if !target.end_key.is_empty() && target.end_key == source.start_key {
            (target.start_key.clone(), source.end_key.clone())
        } else {
            tracing::debug!(region_id = source.id, target_id, "merge regions not adjacent");
            return;
        };
    target.start_key = start_key;
    target.end_key = end_key;
    target.epoch = RegionEpoch::new(
        source.epoch.conf_ver.max(target.epoch.conf_ver),
        source.epoch.version.max(target.epoch.version) + 1,
    );
    target.approximate_size += source.approximate_size;
    target.approximate_keys += source.approximate_keys;
    node.raft().set_region(target);
    node.raft().with_stats(|s| s.merges += 1);
    tracing::debug!(region_id = source.id, target_id, "region merged");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use drift_sched::scheduler::{EmbeddedScheduler, SchedulerConfig, Store, StoreId, GIB};

    use super::*;
    use crate::cluster::Connection;
    use crate::node::NodeOptions;
    use crate::raft::{RaftEngine, SplitPolicy};

    fn region(size: u64) -> Region {
        let leader = Peer::voter(11, 1);
        Region {
            id: 1,
            epoch: RegionEpoch::new(3, 2),
            peers: vec![leader, Peer::voter(12, 2), Peer::learner(13, 3)],
            leader: Some(leader),
            approximate_size: size,
            ..Region::default()
        }
    }

    fn change(change_type: ConfChangeType, peer: Peer) -> RegionHeartbeatResponse {
        RegionHeartbeatResponse {
            region_id: 1,
            region_epoch: RegionEpoch::new(3, 2),
            operation: Operation::ChangePeer { change_type, peer },
        }
    }

    #[test]
    fn add_node_on_learner_promotes() {
        let r = region(96 * MIB);
        let task = Task::from_response(&r, change(ConfChangeType::AddNode, Peer::voter(99, 3)))
            .unwrap();
        assert_eq!(
            task.kind(),
            &TaskKind::PromoteLearner {
                peer: Peer::learner(13, 3)
            }
        );
        assert!(Task::from_response(&r, change(ConfChangeType::AddNode, Peer::voter(99, 2))).is_none());
    }

    #[test]
    fn add_node_starts_snapshot_of_region_size() {
        let r = region(96 * MIB);
        let task = Task::from_response(&r, change(ConfChangeType::AddNode, Peer::voter(40, 4)))
            .unwrap();
        match task.kind() {
            TaskKind::AddPeer { peer, send, recv } => {
                assert_eq!(peer.store_id, 4);
                assert_eq!(send.remaining, 96 * MIB);
                assert_eq!(recv, send);
            }
            other => panic!("unexpected task {other:?}"),
        }
    }

    #[test]
    fn removal_drains_residual_work() {
        let r = region(250 * MIB);
        let mut task =
            Task::from_response(&r, change(ConfChangeType::RemoveNode, Peer::voter(12, 2))).unwrap();
        assert_eq!(task.desc(), "remove-peer");
        assert!(task.working());
        assert!(task.working());
        assert!(!task.working());
    }

    #[test]
    fn snapshot_side_reports_completion_once() {
        let mut stat = SnapshotStat::new(90);
        assert!(!stat.advance(40));
        assert!(!stat.advance(40));
        assert!(stat.advance(40));
        assert!(!stat.advance(40));
        assert!(stat.finished);
    }

    #[test]
    fn merge_task_targets_by_id() {
        let r = region(MIB);
        let target = Region {
            id: 2,
            ..region(MIB)
        };
        let resp = RegionHeartbeatResponse {
            region_id: 1,
            region_epoch: r.epoch,
            operation: Operation::Merge { target },
        };
        let task = Task::from_response(&r, resp).unwrap();
        assert_eq!(task.kind(), &TaskKind::MergeRegion { target: 2 });
        assert_eq!(task.residual, MIB);
    }

    /// Unstarted nodes for `stores` over a raft engine holding `regions`.
    fn cluster(regions: Vec<Region>, stores: &[StoreId]) -> (Arc<Connection>, Arc<RaftEngine>) {
        let conn = Connection::new();
        let raft = Arc::new(RaftEngine::new(
            regions,
            SplitPolicy::default(),
            &conn,
            Duration::from_secs(1),
        ));
        let sched = EmbeddedScheduler::new(SchedulerConfig::default());
        for store_id in stores {
            let opts = NodeOptions {
                io_rate: 40 * MIB,
                rpc_timeout: Duration::from_secs(1),
                capacity: GIB,
                available: GIB,
            };
            let node = Node::new(
                Store::new(*store_id, GIB, GIB),
                Arc::new(sched.client(*store_id)),
                raft.clone(),
                opts,
                None,
            );
            conn.insert(Arc::new(node));
        }
        (conn, raft)
    }

    fn ranged(id: RegionId, start: &[u8], end: &[u8], epoch: RegionEpoch, size: u64) -> Region {
        let leader = Peer::voter(id * 10 + 1, 1);
        Region {
            id,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            epoch,
            peers: vec![leader, Peer::voter(id * 10 + 2, 2)],
            leader: Some(leader),
            approximate_size: size,
            approximate_keys: size / MIB * 1000,
            ..Region::default()
        }
    }

    #[test]
    fn add_peer_ships_a_snapshot_before_joining() {
        let r = ranged(1, b"", b"", RegionEpoch::new(2, 1), 100 * MIB);
        let (conn, raft) = cluster(vec![r.clone()], &[1, 2, 3]);
        let (leader, receiver) = (conn.get(1).unwrap(), conn.get(3).unwrap());
        let used = receiver.usage().used;
        let mut task =
            Task::from_response(&r, change_of(&r, ConfChangeType::AddNode, Peer::voter(31, 3)))
                .unwrap();

        assert!(!task.step(&leader));
        assert_eq!(leader.usage().sending, 1);
        assert_eq!(receiver.usage().receiving, 1);
        assert!(!task.step(&leader));
        assert!(task.step(&leader));

        let region = raft.get_region(1).unwrap();
        assert!(region.peers.contains(&Peer::voter(31, 3)));
        assert_eq!(region.epoch, RegionEpoch::new(3, 1));
        assert_eq!(receiver.usage().used, used + 100 * MIB);
        assert_eq!(leader.usage().sending, 0);
        assert_eq!(receiver.usage().receiving, 0);
        let stats = raft.stats();
        assert_eq!(stats.peers_added, 1);
        assert_eq!(stats.snapshots_received, 1);
    }

    #[test]
    fn stale_task_is_dropped_without_effect() {
        let r = ranged(1, b"", b"", RegionEpoch::new(2, 1), 100 * MIB);
        let (conn, raft) = cluster(vec![r.clone()], &[1, 2, 3]);
        let (leader, receiver) = (conn.get(1).unwrap(), conn.get(3).unwrap());
        let mut task =
            Task::from_response(&r, change_of(&r, ConfChangeType::AddNode, Peer::voter(31, 3)))
                .unwrap();
        assert!(!task.step(&leader));

        let mut moved = r.clone();
        moved.epoch.conf_ver += 1;
        raft.set_region(moved.clone());
        assert!(task.step(&leader));

        assert_eq!(raft.get_region(1).unwrap(), moved);
        assert_eq!(leader.usage().sending, 0);
        assert_eq!(receiver.usage().receiving, 0);
        assert_eq!(raft.stats().peers_added, 0);
    }

    #[test]
    fn merge_absorbs_the_source_range() {
        let source = ranged(1, b"", b"m", RegionEpoch::new(2, 5), 50 * MIB);
        let target = ranged(2, b"m", b"", RegionEpoch::new(4, 3), 100 * MIB);
        let (conn, raft) = cluster(vec![source.clone(), target], &[1, 2]);
        let mut task = Task::new(&source, source.epoch, TaskKind::MergeRegion { target: 2 });

        assert!(task.step(&conn.get(1).unwrap()));

        assert_eq!(raft.regions().len(), 1);
        assert!(raft.get_region(1).is_none());
        let merged = raft.get_region(2).unwrap();
        assert!(merged.start_key.is_empty() && merged.end_key.is_empty());
        assert_eq!(merged.epoch, RegionEpoch::new(4, 6));
        assert_eq!(merged.approximate_size, 150 * MIB);
        assert_eq!(merged.approximate_keys, 150_000);
        assert_eq!(raft.stats().merges, 1);
    }

    #[test]
    fn leader_transfer_is_recorded_per_store_pair() {
        let r = ranged(1, b"", b"", RegionEpoch::new(2, 1), MIB);
        let (conn, raft) = cluster(vec![r.clone()], &[1, 2]);
        let leader = conn.get(1).unwrap();
        let transfer = |to| RegionHeartbeatResponse {
            region_id: 1,
            region_epoch: r.epoch,
            operation: Operation::TransferLeader { peer: to },
        };

        let mut missing = Task::from_response(&r, transfer(Peer::voter(99, 3))).unwrap();
        assert!(missing.step(&leader));
        assert_eq!(raft.get_region(1).unwrap().leader_store_id(), Some(1));
        assert_eq!(raft.stats().total_leader_transfers(), 0);

        let mut task = Task::from_response(&r, transfer(Peer::voter(12, 2))).unwrap();
        assert!(task.step(&leader));
        assert_eq!(raft.get_region(1).unwrap().leader_store_id(), Some(2));
        assert_eq!(raft.stats().leader_transfers[&1][&2], 1);
    }

    fn change_of(r: &Region, change_type: ConfChangeType, peer: Peer) -> RegionHeartbeatResponse {
        RegionHeartbeatResponse {
            region_id: r.id,
            region_epoch: r.epoch,
            operation: Operation::ChangePeer { change_type, peer },
        }
    }
}
