//! Cluster view and per-region planning for the embedded scheduler.
//!
//! Planning is driven by region heartbeats: each heartbeat of a region without
//! an in-flight operator runs the checkers below in priority order and yields
//! at most one operator for that region.
//!
//! Inputs:
//! - the scheduler's cluster view (stores, last reported regions)
//! - in-flight operators (their remaining steps count as pending influence)
//!
//! Output:
//! - `Some(Operator)` for the heartbeating region, or `None`

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::embedded::SchedulerConfig;
use super::id_alloc::IdAllocator;
use super::operator::{OpKind, OpStep, Operator};
use super::types::{
    ranges_overlap, Peer, Region, RegionId, Store, StoreId, StoreState, StoreStats,
};

const EPSILON: f64 = 1e-9;

#[derive(Clone, Debug)]
pub(crate) struct StoreInfo {
    pub store: Store,
    pub stats: Option<StoreStats>,
    /// False once the store's client closed.
    pub connected: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct RegionInfo {
    pub region: Region,
    /// Heartbeats seen since the region's version last changed.
    pub stable_heartbeats: u32,
}

pub(crate) enum RegionUpdate {
    /// An equal or newer view is already known.
    Stale,
    Applied { displaced: Vec<RegionId> },
}

#[derive(Debug, Default)]
pub(crate) struct ClusterView {
    pub stores: BTreeMap<StoreId, StoreInfo>,
    pub regions: BTreeMap<RegionId, RegionInfo>,
}

impl ClusterView {
    pub fn put_store(&mut self, store: Store) {
        match self.stores.get_mut(&store.id) {
            Some(info) => {
                info.store = store;
                info.connected = true;
            }
            None => {
                self.stores.insert(
                    store.id,
                    StoreInfo {
                        store,
                        stats: None,
                        connected: true,
                    },
                );
            }
        }
    }

    /// Records store stats. Returns false for unknown stores.
    pub fn update_stats(&mut self, stats: StoreStats) -> bool {
        let Some(info) = self.stores.get_mut(&stats.store_id) else {
            return false;
        };
        info.stats = Some(stats);
        true
    }

    pub fn disconnect(&mut self, store_id: StoreId) {
        if let Some(info) = self.stores.get_mut(&store_id) {
            info.connected = false;
        }
    }

    pub fn is_healthy(&self, store_id: StoreId) -> bool {
        self.stores
            .get(&store_id)
            .is_some_and(|s| s.connected && s.store.state == StoreState::Up)
    }

    pub fn schedulable_stores(&self) -> Vec<StoreId> {
        self.stores
            .keys()
            .copied()
            .filter(|id| self.is_healthy(*id))
            .collect()
    }

    pub fn region(&self, region_id: RegionId) -> Option<&Region> {
        self.regions.get(&region_id).map(|info| &info.region)
    }

    /// Replaces the stored copy of `region` and drops every other region
    /// whose range it now covers.
    pub fn update_region(&mut self, region: Region) -> RegionUpdate {
        let mut stable_heartbeats = 0;
        if let Some(existing) = self.regions.get(&region.id) {
            if existing.region.epoch.is_newer_than(&region.epoch) {
                return RegionUpdate::Stale;
            }
            if existing.region.epoch.version == region.epoch.version {
                stable_heartbeats = existing.stable_heartbeats.saturating_add(1);
            }
        }

        let mut displaced = Vec::new();
        for info in self.regions.values() {
            let other = &info.region;
            if other.id == region.id
                || !ranges_overlap(
                    &other.start_key,
                    &other.end_key,
                    &region.start_key,
                    &region.end_key,
                )
            {
                continue;
            }
            if other.epoch.version > region.epoch.version {
                return RegionUpdate::Stale;
            }
            displaced.push(other.id);
        }
        for id in &displaced {
            self.regions.remove(id);
        }
        self.regions.insert(
            region.id,
            RegionInfo {
                region,
                stable_heartbeats,
            },
        );
        RegionUpdate::Applied { displaced }
    }

    /// Regions sharing a boundary with `region`, right neighbour first.
    fn neighbors<'a>(&'a self, region: &'a Region) -> impl Iterator<Item = &'a Region> + 'a {
        let next = self.regions.values().map(|i| &i.region).find(|r| {
            !region.end_key.is_empty() && r.start_key == region.end_key
        });
        let prev = self.regions.values().map(|i| &i.region).find(|r| {
            !region.start_key.is_empty() && r.end_key == region.start_key
        });
        next.into_iter().chain(prev)
    }

    /// Largest known capacity divided by this store's capacity.
    fn capacity_factor(&self, store_id: StoreId) -> f64 {
        let max = self
            .stores
            .values()
            .map(|s| s.store.capacity)
            .max()
            .unwrap_or(0);
        let own = self
            .stores
            .get(&store_id)
            .map(|s| s.store.capacity)
            .unwrap_or(0);
        if own == 0 || max == 0 {
            1.0
        } else {
            max as f64 / own as f64
        }
    }

    fn weights(&self, store_id: StoreId) -> (f64, f64) {
        self.stores
            .get(&store_id)
            .map(|s| (s.store.leader_weight, s.store.region_weight))
            .unwrap_or((1.0, 1.0))
    }
}

/// Leader and peer counts per store, including pending operator influence.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    leaders: BTreeMap<StoreId, i64>,
    peers: BTreeMap<StoreId, i64>,
}

impl Tally {
    pub fn collect(
        view: &ClusterView,
        operators: &BTreeMap<RegionId, Operator>,
        filter: impl Fn(&Region) -> bool,
    ) -> Self {
        let mut tally = Tally::default();
        for id in view.stores.keys() {
            tally.leaders.insert(*id, 0);
            tally.peers.insert(*id, 0);
        }
        for info in view.regions.values() {
            let region = &info.region;
            if !filter(region) {
                continue;
            }
            if let Some(store_id) = region.leader_store_id() {
                *tally.leaders.entry(store_id).or_default() += 1;
            }
            for peer in &region.peers {
                *tally.peers.entry(peer.store_id).or_default() += 1;
            }
        }
        for op in operators.values() {
            let Some(region) = view.region(op.region_id) else {
                continue;
            };
            if !filter(region) {
                continue;
            }
            let mut leader = region.leader_store_id();
            for step in op.remaining() {
                match step {
                    OpStep::AddPeer { peer } => {
                        *tally.peers.entry(peer.store_id).or_default() += 1;
                    }
                    OpStep::RemovePeer { store_id } => {
                        *tally.peers.entry(*store_id).or_default() -= 1;
                    }
                    OpStep::TransferLeader { to_store } => {
                        if let Some(from) = leader {
                            *tally.leaders.entry(from).or_default() -= 1;
                        }
                        *tally.leaders.entry(*to_store).or_default() += 1;
                        leader = Some(*to_store);
                    }
                    OpStep::Merge { .. } => {}
                }
            }
        }
        tally
    }

    pub fn leaders(&self, store_id: StoreId) -> i64 {
        self.leaders.get(&store_id).copied().unwrap_or(0)
    }

    pub fn peers(&self, store_id: StoreId) -> i64 {
        self.peers.get(&store_id).copied().unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HotKind {
    Read,
    Write,
}

pub(crate) struct Planner<'a> {
    pub view: &'a ClusterView,
    pub operators: &'a BTreeMap<RegionId, Operator>,
    pub cfg: &'a SchedulerConfig,
    pub ids: &'a IdAllocator,
}

impl Planner<'_> {
    pub fn plan(&self, region: &Region) -> Option<Operator> {
        if self.operators.contains_key(&region.id) || self.is_merge_target(region.id) {
            return None;
        }
        self.check_replicas(region)
            .or_else(|| self.check_merge(region))
            .or_else(|| self.balance_hot(region))
            .or_else(|| self.balance_region(region))
            .or_else(|| self.balance_leader(region))
    }

    fn has_budget(&self, kind: OpKind) -> bool {
        let limit = match kind {
            OpKind::Replica => self.cfg.replica_schedule_limit,
            OpKind::Merge => self.cfg.merge_schedule_limit,
            OpKind::HotRegion => self.cfg.hot_region_schedule_limit,
            OpKind::Region => self.cfg.region_schedule_limit,
            OpKind::Leader => self.cfg.leader_schedule_limit,
        };
        self.operators.values().filter(|op| op.kind == kind).count() < limit
    }

    fn is_merge_target(&self, region_id: RegionId) -> bool {
        self.operators.values().any(|op| {
            op.remaining()
                .iter()
                .any(|step| matches!(step, OpStep::Merge { target } if *target == region_id))
        })
    }

    fn healthy_peer(&self, region: &Region, peer: &Peer) -> bool {
        self.view.is_healthy(peer.store_id) && !region.is_down_peer(peer.id)
    }

    /// Leader present, every peer a healthy voter, replica count satisfied.
    fn region_is_clean(&self, region: &Region) -> bool {
        region.leader.is_some()
            && region.down_peers.is_empty()
            && region.pending_peers.is_empty()
            && region.peers.len() == self.cfg.max_replicas
            && region
                .peers
                .iter()
                .all(|p| !p.is_learner() && self.healthy_peer(region, p))
    }

    fn region_unit(&self, store_id: StoreId) -> f64 {
        let (_, region_weight) = self.view.weights(store_id);
        self.view.capacity_factor(store_id) / region_weight.max(EPSILON)
    }

    fn region_score(&self, tally: &Tally, store_id: StoreId) -> f64 {
        tally.peers(store_id) as f64 * self.region_unit(store_id)
    }

    fn leader_unit(&self, store_id: StoreId) -> f64 {
        let (leader_weight, _) = self.view.weights(store_id);
        1.0 / leader_weight.max(EPSILON)
    }

    fn leader_score(&self, tally: &Tally, store_id: StoreId) -> f64 {
        tally.leaders(store_id) as f64 * self.leader_unit(store_id)
    }

    /// Orders by score, lower store id first on ties.
    fn by_score(a: (f64, StoreId), b: (f64, StoreId)) -> Ordering {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    }

    /// Orders by descending score, lower store id first on ties.
    fn by_score_desc(a: (f64, StoreId), b: (f64, StoreId)) -> Ordering {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    }

    /// Lowest-scored schedulable store that does not host the region.
    fn pick_region_target(&self, region: &Region, tally: &Tally) -> Option<StoreId> {
        let members = region.store_ids();
        self.view
            .schedulable_stores()
            .into_iter()
            .filter(|id| !members.contains(id))
            .map(|id| (self.region_score(tally, id), id))
            .min_by(|a, b| Self::by_score(*a, *b))
            .map(|(_, id)| id)
    }

    fn check_replicas(&self, region: &Region) -> Option<Operator> {
        if !self.has_budget(OpKind::Replica) {
            return None;
        }
        let healthy: Vec<&Peer> = region
            .voters()
            .filter(|p| self.healthy_peer(region, p))
            .collect();

        if healthy.len() < self.cfg.max_replicas {
            let tally = Tally::collect(self.view, self.operators, |_| true);
            let target = self.pick_region_target(region, &tally)?;
            let peer = Peer::voter(self.ids.alloc(), target);
            return Some(Operator::new(
                OpKind::Replica,
                region.id,
                "make-up-replica",
                vec![OpStep::AddPeer { peer }],
            ));
        }

        let leader_id = region.leader.map(|p| p.id);
        if let Some(bad) = region
            .peers
            .iter()
            .find(|p| !self.healthy_peer(region, p) && Some(p.id) != leader_id)
        {
            return Some(Operator::new(
                OpKind::Replica,
                region.id,
                "remove-down-replica",
                vec![OpStep::RemovePeer {
                    store_id: bad.store_id,
                }],
            ));
        }

        if healthy.len() > self.cfg.max_replicas {
            let tally = Tally::collect(self.view, self.operators, |_| true);
            let leader = region.leader_store_id();
            let victim = healthy
                .iter()
                .filter(|p| Some(p.store_id) != leader)
                .map(|p| (self.region_score(&tally, p.store_id), p.store_id))
                .min_by(|a, b| Self::by_score_desc(*a, *b))?;
            return Some(Operator::new(
                OpKind::Replica,
                region.id,
                "remove-extra-replica",
                vec![OpStep::RemovePeer { store_id: victim.1 }],
            ));
        }
        None
    }

    fn mergeable(&self, region: &Region) -> bool {
        region.approximate_size <= self.cfg.max_merge_region_size
            && region.approximate_keys <= self.cfg.max_merge_region_keys
            && self.region_is_clean(region)
    }

    /// `target` can absorb `source` without reaching a split threshold.
    fn can_absorb(&self, target: &Region, source: &Region) -> bool {
        !self.operators.contains_key(&target.id)
            && !self.is_merge_target(target.id)
            && self.region_is_clean(target)
            && target.approximate_size + source.approximate_size < self.cfg.max_region_size
            && target.approximate_keys + source.approximate_keys < self.cfg.max_region_keys
    }

    fn check_merge(&self, region: &Region) -> Option<Operator> {
        if !self.has_budget(OpKind::Merge) || !self.mergeable(region) {
            return None;
        }
        let stable = self.view.regions.get(&region.id)?.stable_heartbeats;
        if stable < self.cfg.split_merge_heartbeats {
            return None;
        }
        // The smaller neighbour keeps merged sizes even.
        let target = self
            .view
            .neighbors(region)
            .filter(|t| self.can_absorb(t, region))
            .min_by_key(|t| t.approximate_size)?;

        let source_stores = region.store_ids();
        let target_stores = target.store_ids();
        let mut steps = Vec::new();
        for store_id in target_stores.iter().filter(|s| !source_stores.contains(s)) {
            steps.push(OpStep::AddPeer {
                peer: Peer::voter(self.ids.alloc(), *store_id),
            });
        }
        // Leadership must sit on a store that survives the alignment.
        if let Some(leader) = region.leader_store_id() {
            if !target_stores.contains(&leader) {
                let to_store = *target_stores.first()?;
                steps.push(OpStep::TransferLeader { to_store });
            }
        }
        for store_id in source_stores.iter().filter(|s| !target_stores.contains(s)) {
            steps.push(OpStep::RemovePeer {
                store_id: *store_id,
            });
        }
        steps.push(OpStep::Merge { target: target.id });
        Some(Operator::new(OpKind::Merge, region.id, "merge-region", steps))
    }

    fn balance_hot(&self, region: &Region) -> Option<Operator> {
        if !self.has_budget(OpKind::HotRegion) || !self.region_is_clean(region) {
            return None;
        }
        let min = self.cfg.hot_region_min_bytes;
        if region.read_bytes >= min {
            if let Some(op) = self.balance_hot_kind(region, HotKind::Read) {
                return Some(op);
            }
        }
        if region.written_bytes >= min {
            return self.balance_hot_kind(region, HotKind::Write);
        }
        None
    }

    fn balance_hot_kind(&self, region: &Region, kind: HotKind) -> Option<Operator> {
        let min = self.cfg.hot_region_min_bytes;
        let tally = Tally::collect(self.view, self.operators, |r| match kind {
            HotKind::Read => r.read_bytes >= min,
            HotKind::Write => r.written_bytes >= min,
        });
        let leader = region.leader_store_id()?;

        if let Some(follower) = region
            .followers()
            .map(|p| p.store_id)
            .min_by_key(|s| (tally.leaders(*s), *s))
        {
            if tally.leaders(leader) >= tally.leaders(follower) + 2 {
                let desc = match kind {
                    HotKind::Read => "transfer-hot-read-leader",
                    HotKind::Write => "transfer-hot-write-leader",
                };
                return Some(Operator::new(
                    OpKind::HotRegion,
                    region.id,
                    desc,
                    vec![OpStep::TransferLeader {
                        to_store: follower,
                    }],
                ));
            }
        }

        let members = region.store_ids();
        let outside: Vec<StoreId> = self
            .view
            .schedulable_stores()
            .into_iter()
            .filter(|s| !members.contains(s))
            .collect();

        match kind {
            HotKind::Read => {
                let target = outside
                    .into_iter()
                    .min_by_key(|s| (tally.leaders(*s), *s))?;
                if tally.leaders(leader) < tally.leaders(target) + 2 {
                    return None;
                }
                Some(Operator::new(
                    OpKind::HotRegion,
                    region.id,
                    "move-hot-read-region",
                    vec![
                        OpStep::AddPeer {
                            peer: Peer::voter(self.ids.alloc(), target),
                        },
                        OpStep::TransferLeader { to_store: target },
                        OpStep::RemovePeer { store_id: leader },
                    ],
                ))
            }
            HotKind::Write => {
                let source = members
                    .iter()
                    .copied()
                    .max_by(|a, b| tally.peers(*a).cmp(&tally.peers(*b)).then(b.cmp(a)))?;
                let target = outside.into_iter().min_by_key(|s| (tally.peers(*s), *s))?;
                if tally.peers(source) < tally.peers(target) + 2 {
                    return None;
                }
                let mut steps = vec![OpStep::AddPeer {
                    peer: Peer::voter(self.ids.alloc(), target),
                }];
                if source == leader {
                    steps.push(OpStep::TransferLeader { to_store: target });
                }
                steps.push(OpStep::RemovePeer { store_id: source });
                Some(Operator::new(
                    OpKind::HotRegion,
                    region.id,
                    "move-hot-write-region",
                    steps,
                ))
            }
        }
    }

    fn balance_region(&self, region: &Region) -> Option<Operator> {
        if !self.has_budget(OpKind::Region) || !self.region_is_clean(region) {
            return None;
        }
        let tally = Tally::collect(self.view, self.operators, |_| true);
        let source = region
            .voters()
            .map(|p| (self.region_score(&tally, p.store_id), p.store_id))
            .min_by(|a, b| Self::by_score_desc(*a, *b))?
            .1;
        let target = self.pick_region_target(region, &tally)?;
        let gap = self.region_score(&tally, source) - self.region_score(&tally, target);
        if gap + EPSILON < self.region_unit(source) + self.region_unit(target) {
            return None;
        }

        let mut steps = vec![OpStep::AddPeer {
            peer: Peer::voter(self.ids.alloc(), target),
        }];
        if region.leader_store_id() == Some(source) {
            let to_store = region
                .followers()
                .map(|p| p.store_id)
                .chain(std::iter::once(target))
                .filter(|s| *s != source)
                .min_by_key(|s| (tally.leaders(*s), *s))?;
            steps.push(OpStep::TransferLeader { to_store });
        }
        steps.push(OpStep::RemovePeer { store_id: source });
        Some(Operator::new(
            OpKind::Region,
            region.id,
            "balance-region",
            steps,
        ))
    }

    fn balance_leader(&self, region: &Region) -> Option<Operator> {
        if !self.has_budget(OpKind::Leader) {
            return None;
        }
        let leader = region.leader_store_id()?;
        let tally = Tally::collect(self.view, self.operators, |_| true);
        let target = region
            .followers()
            .filter(|p| self.healthy_peer(region, p))
            .map(|p| (self.leader_score(&tally, p.store_id), p.store_id))
            .min_by(|a, b| Self::by_score(*a, *b))?
            .1;
        let gap = self.leader_score(&tally, leader) - self.leader_score(&tally, target);
        if gap + EPSILON < self.leader_unit(leader) + self.leader_unit(target) {
            return None;
        }
        Some(Operator::new(
            OpKind::Leader,
            region.id,
            "balance-leader",
            vec![OpStep::TransferLeader { to_store: target }],
        ))
    }
}
