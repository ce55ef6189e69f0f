use std::collections::BTreeMap;
use std::fmt;

use drift_sched::scheduler::StoreId;
use serde::Serialize;

/// Counters of the mutations the simulated cluster applied on behalf of the
/// scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub splits: u64,
    pub merges: u64,
    pub peers_added: u64,
    pub learners_added: u64,
    pub learners_promoted: u64,
    pub peers_removed: u64,
    pub snapshots_sent: u64,
    pub snapshots_received: u64,
    /// `from store -> to store -> count`.
    pub leader_transfers: BTreeMap<StoreId, BTreeMap<StoreId, u64>>,
}

impl SchedulerStats {
    pub fn record_leader_transfer(&mut self, from: StoreId, to: StoreId) {
        *self
            .leader_transfers
            .entry(from)
            .or_default()
            .entry(to)
            .or_default() += 1;
    }

    pub fn total_leader_transfers(&self) -> u64 {
        self.leader_transfers
            .values()
            .flat_map(BTreeMap::values)
            .sum()
    }
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "splits: {}, merges: {}, peers added: {}, learners added: {}, promoted: {}, peers removed: {}",
            self.splits,
            self.merges,
            self.peers_added,
            self.learners_added,
            self.learners_promoted,
            self.peers_removed
        )?;
        writeln!(
            f,
            "snapshots sent: {}, received: {}",
            self.snapshots_sent, self.snapshots_received
        )?;
        write!(f, "leader transfers: {}", self.total_leader_transfers())?;
        for (from, targets) in &self.leader_transfers {
            for (to, count) in targets {
                write!(f, "\n  store {from} -> store {to}: {count}")?;
            }
        }
        Ok(())
    }
}
