//! Indexed region map shared by the raft engine, nodes and checkers.
//!
//! Regions are indexed by id, by start key (ordered), by leader store and by
//! member store. Every write keeps the secondary indexes and the total size
//! aggregate in step under one write lock; reads take the shared lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use drift_sched::scheduler::{ranges_overlap, Region, RegionId, StoreId};

#[derive(Debug, Default)]
struct Index {
    regions: HashMap<RegionId, Region>,
    by_start: BTreeMap<Vec<u8>, RegionId>,
    leaders: HashMap<StoreId, BTreeSet<RegionId>>,
    members: HashMap<StoreId, BTreeSet<RegionId>>,
    total_size: u64,
}

impl Index {
    fn insert(&mut self, region: Region) {
        self.by_start.insert(region.start_key.clone(), region.id);
        if let Some(store_id) = region.leader_store_id() {
            self.leaders.entry(store_id).or_default().insert(region.id);
        }
        for peer in &region.peers {
            self.members
                .entry(peer.store_id)
                .or_default()
                .insert(region.id);
        }
        self.total_size += region.approximate_size;
        self.regions.insert(region.id, region);
    }

    fn remove(&mut self, region_id: RegionId) -> Option<Region> {
        let region = self.regions.remove(&region_id)?;
        if self.by_start.get(&region.start_key) == Some(&region_id) {
            self.by_start.remove(&region.start_key);
        }
        if let Some(store_id) = region.leader_store_id() {
            if let Some(set) = self.leaders.get_mut(&store_id) {
                set.remove(&region_id);
            }
        }
        for peer in &region.peers {
            if let Some(set) = self.members.get_mut(&peer.store_id) {
                set.remove(&region_id);
            }
        }
        self.total_size = self.total_size.saturating_sub(region.approximate_size);
        Some(region)
    }

    /// Ids of regions intersecting `[start, end)`, in key order.
    fn overlapping(&self, start: &[u8], end: &[u8]) -> Vec<RegionId> {
        let mut ids = Vec::new();
        // The region starting at or before `start` may still cover it.
        if let Some((_, id)) = self
            .by_start
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(start)))
            .next_back()
        {
            if let Some(r) = self.regions.get(id) {
                if ranges_overlap(&r.start_key, &r.end_key, start, end) {
                    ids.push(*id);
                }
            }
        }
        for (key, id) in self
            .by_start
            .range::<[u8], _>((Bound::Excluded(start), Bound::Unbounded))
        {
            if !end.is_empty() && key.as_slice() >= end {
                break;
            }
            ids.push(*id);
        }
        ids
    }

    fn set(&mut self, region: Region) -> Vec<Region> {
        let mut displaced = Vec::new();
        self.remove(region.id);
        for id in self.overlapping(&region.start_key, &region.end_key) {
            if let Some(old) = self.remove(id) {
                displaced.push(old);
            }
        }
        self.insert(region);
        displaced
    }
}

#[derive(Debug, Default)]
pub struct RegionStore {
    inner: RwLock<Index>,
}

impl RegionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, region_id: RegionId) -> Option<Region> {
        self.read().regions.get(&region_id).cloned()
    }

    /// Inserts or overwrites `region`. Regions whose range it overlaps are
    /// removed and returned.
    pub fn set(&self, region: Region) -> Vec<Region> {
        self.write().set(region)
    }

    /// Applies several writes under a single lock acquisition.
    pub fn set_all(&self, regions: Vec<Region>) -> Vec<Region> {
        let mut index = self.write();
        let mut displaced = Vec::new();
        for region in regions {
            displaced.extend(index.set(region));
        }
        let written: BTreeSet<RegionId> = index.regions.keys().copied().collect();
        displaced.retain(|r| !written.contains(&r.id));
        displaced
    }

    /// Applies `f` to the stored copy of `region_id` in place.
    ///
    /// `f` must not change the key range or the membership.
    pub fn update<F>(&self, region_id: RegionId, f: F) -> Option<Region>
    where
        F: FnOnce(&mut Region),
    {
        let mut index = self.write();
        let region = index.regions.get_mut(&region_id)?;
        let before = region.approximate_size;
        f(region);
        let after = region.approximate_size;
        let snapshot = region.clone();
        index.total_size = index.total_size - before.min(index.total_size) + after;
        Some(snapshot)
    }

    pub fn remove(&self, region_id: RegionId) -> Option<Region> {
        self.write().remove(region_id)
    }

    /// Regions intersecting `[start, end)` ordered by start key; `limit == 0`
    /// means no limit.
    pub fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Region> {
        let index = self.read();
        let ids = index.overlapping(start, end);
        let take = if limit == 0 { ids.len() } else { limit };
        ids.iter()
            .take(take)
            .filter_map(|id| index.regions.get(id).cloned())
            .collect()
    }

    pub fn search(&self, key: &[u8]) -> Option<Region> {
        let index = self.read();
        let (_, id) = index
            .by_start
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()?;
        index
            .regions
            .get(id)
            .filter(|r| r.contains_key(key))
            .cloned()
    }

    /// Every region, ordered by start key.
    pub fn regions(&self) -> Vec<Region> {
        let index = self.read();
        index
            .by_start
            .values()
            .filter_map(|id| index.regions.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leader_count(&self, store_id: StoreId) -> usize {
        self.read().leaders.get(&store_id).map_or(0, BTreeSet::len)
    }

    pub fn region_count(&self, store_id: StoreId) -> usize {
        self.read().members.get(&store_id).map_or(0, BTreeSet::len)
    }

    /// Regions led by `store_id`, ordered by id.
    pub fn leader_regions(&self, store_id: StoreId) -> Vec<Region> {
        let index = self.read();
        index
            .leaders
            .get(&store_id)
            .into_iter()
            .flatten()
            .filter_map(|id| index.regions.get(id).cloned())
            .collect()
    }

    /// Regions with a peer on `store_id`, ordered by id.
    pub fn store_regions(&self, store_id: StoreId) -> Vec<Region> {
        let index = self.read();
        index
            .members
            .get(&store_id)
            .into_iter()
            .flatten()
            .filter_map(|id| index.regions.get(id).cloned())
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.read().total_size
    }

    pub fn average_size(&self) -> u64 {
        let index = self.read();
        match index.regions.len() {
            0 => 0,
            n => index.total_size / n as u64,
        }
    }
}
