//! Metadata shared by the simulated cluster and the scheduler.
//!
//! Key ranges are lexicographic byte ranges `[start_key, end_key)`. An empty
//! start key means "from the beginning" and an empty end key means "to the
//! end".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical store (node) identifier.
pub type StoreId = u64;
/// Logical region identifier.
pub type RegionId = u64;
/// Logical peer identifier, unique across all regions.
pub type PeerId = u64;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Operational status of a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    #[default]
    Up,
    Offline,
    Tombstone,
}

/// Store descriptor registered with the scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub state: StoreState,
    /// Total capacity in bytes.
    pub capacity: u64,
    /// Bytes available when the store joins.
    pub available: u64,
    pub labels: BTreeMap<String, String>,
    pub leader_weight: f64,
    pub region_weight: f64,
    pub version: String,
}

impl Store {
    pub fn new(id: StoreId, capacity: u64, available: u64) -> Self {
        Self {
            id,
            state: StoreState::Up,
            capacity,
            available: available.min(capacity),
            labels: BTreeMap::new(),
            leader_weight: 1.0,
            region_weight: 1.0,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    #[default]
    Voter,
    Learner,
}

/// One replica of a region on one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub store_id: StoreId,
    pub role: PeerRole,
}

impl Peer {
    pub const fn voter(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    pub const fn learner(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }

    pub fn is_learner(&self) -> bool {
        self.role == PeerRole::Learner
    }
}

/// Region epoch: `conf_ver` moves on membership changes, `version` on range changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

impl RegionEpoch {
    pub const fn new(conf_ver: u64, version: u64) -> Self {
        Self { conf_ver, version }
    }

    /// True when `self` is ahead of `other` on either axis.
    pub fn is_newer_than(&self, other: &RegionEpoch) -> bool {
        self.conf_ver > other.conf_ver || self.version > other.version
    }
}

/// A peer the leader considers unreachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub peer: Peer,
    pub down_seconds: u64,
}

/// Region descriptor as reported by the leader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
    pub leader: Option<Peer>,
    pub approximate_size: u64,
    pub approximate_keys: u64,
    pub down_peers: Vec<PeerStats>,
    pub pending_peers: Vec<Peer>,
    /// Bytes written during the last tick.
    pub written_bytes: u64,
    /// Bytes read during the last tick.
    pub read_bytes: u64,
}

impl Region {
    pub fn store_peer(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn store_ids(&self) -> Vec<StoreId> {
        self.peers.iter().map(|p| p.store_id).collect()
    }

    pub fn leader_store_id(&self) -> Option<StoreId> {
        self.leader.map(|p| p.store_id)
    }

    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| !p.is_learner())
    }

    /// Voters other than the leader.
    pub fn followers(&self) -> impl Iterator<Item = &Peer> {
        let leader = self.leader.map(|p| p.id);
        self.voters().filter(move |p| Some(p.id) != leader)
    }

    pub fn is_down_peer(&self, peer_id: PeerId) -> bool {
        self.down_peers.iter().any(|d| d.peer.id == peer_id)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key_in_range(key, &self.start_key, &self.end_key)
    }
}

/// Returns true when `key` lies in `[start, end)`, with empty bounds open.
pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    key >= start && (end.is_empty() || key < end)
}

/// Returns true when `[a_start, a_end)` and `[b_start, b_end)` share at least one key.
pub fn ranges_overlap(a_start: &[u8], a_end: &[u8], b_start: &[u8], b_end: &[u8]) -> bool {
    let a_before_b_ends = b_end.is_empty() || a_start < b_end;
    let b_before_a_ends = a_end.is_empty() || b_start < a_end;
    a_before_b_ends && b_before_a_ends
}

/// Store statistics carried by a store heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub store_id: StoreId,
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,
    pub to_compaction_size: u64,
    pub sending_snap_count: u32,
    pub receiving_snap_count: u32,
    pub region_count: u64,
    /// Unix seconds when the node started.
    pub start_time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfChangeType {
    AddNode,
    AddLearnerNode,
    RemoveNode,
}

/// Instruction carried by a region heartbeat response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    ChangePeer {
        change_type: ConfChangeType,
        peer: Peer,
    },
    TransferLeader {
        peer: Peer,
    },
    Merge {
        target: Region,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionHeartbeatResponse {
    pub region_id: RegionId,
    pub region_epoch: RegionEpoch,
    pub operation: Operation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_bounds_cover_everything() {
        assert!(key_in_range(b"", b"", b""));
        assert!(key_in_range(b"zzz", b"", b""));
        assert!(key_in_range(b"m", b"a", b""));
        assert!(!key_in_range(b"m", b"a", b"m"));
        assert!(!key_in_range(b"a", b"b", b""));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        assert!(!ranges_overlap(b"", b"m", b"m", b""));
        assert!(ranges_overlap(b"", b"n", b"m", b""));
        assert!(ranges_overlap(b"", b"", b"a", b"b"));
        assert!(!ranges_overlap(b"a", b"b", b"c", b"d"));
    }

    #[test]
    fn epoch_newer_on_either_axis() {
        let base = RegionEpoch::new(2, 5);
        assert!(RegionEpoch::new(3, 5).is_newer_than(&base));
        assert!(RegionEpoch::new(2, 6).is_newer_than(&base));
        assert!(!RegionEpoch::new(2, 5).is_newer_than(&base));
        assert!(!RegionEpoch::new(1, 4).is_newer_than(&base));
    }

    #[test]
    fn followers_exclude_leader_and_learners() {
        let leader = Peer::voter(10, 1);
        let region = Region {
            id: 1,
            peers: vec![leader, Peer::voter(11, 2), Peer::learner(12, 3)],
            leader: Some(leader),
            ..Region::default()
        };
        let followers: Vec<_> = region.followers().map(|p| p.store_id).collect();
        assert_eq!(followers, vec![2]);
        assert_eq!(region.voters().count(), 2);
    }
}
