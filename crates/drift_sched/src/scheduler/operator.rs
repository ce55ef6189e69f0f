//! Multi-step operators dispatched one step per region heartbeat.
//!
//! A step is considered applied once a later heartbeat shows its effect on
//! the region (peer present, peer gone, leader moved). Merge steps are never
//! observed on the source region; the operator ends when the source region
//! disappears from the cluster view.

use super::types::{
    ConfChangeType, Operation, Peer, Region, RegionHeartbeatResponse, RegionId, StoreId,
};

/// Operator family, used for per-kind concurrency limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum OpKind {
    Replica,
    Merge,
    HotRegion,
    Region,
    Leader,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum OpStep {
    AddPeer { peer: Peer },
    RemovePeer { store_id: StoreId },
    TransferLeader { to_store: StoreId },
    Merge { target: RegionId },
}

impl OpStep {
    fn is_applied(&self, region: &Region) -> bool {
        match self {
            OpStep::AddPeer { peer } => region
                .store_peer(peer.store_id)
                .is_some_and(|p| !p.is_learner()),
            OpStep::RemovePeer { store_id } => region.store_peer(*store_id).is_none(),
            OpStep::TransferLeader { to_store } => region.leader_store_id() == Some(*to_store),
            OpStep::Merge { .. } => false,
        }
    }

    /// Builds the heartbeat response for this step. `target` must be the
    /// current view of the merge target for merge steps.
    pub(crate) fn to_response(
        &self,
        region: &Region,
        target: Option<&Region>,
    ) -> Option<RegionHeartbeatResponse> {
        let operation = match self {
            OpStep::AddPeer { peer } => Operation::ChangePeer {
                change_type: ConfChangeType::AddNode,
                peer: *peer,
            },
            OpStep::RemovePeer { store_id } => Operation::ChangePeer {
                change_type: ConfChangeType::RemoveNode,
                peer: *region.store_peer(*store_id)?,
            },
            OpStep::TransferLeader { to_store } => Operation::TransferLeader {
                peer: *region.store_peer(*to_store)?,
            },
            OpStep::Merge { .. } => Operation::Merge {
                target: target?.clone(),
            },
        };
        Some(RegionHeartbeatResponse {
            region_id: region.id,
            region_epoch: region.epoch,
            operation,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Operator {
    pub kind: OpKind,
    pub region_id: RegionId,
    pub desc: &'static str,
    steps: Vec<OpStep>,
    current: usize,
    /// Dispatches of the current step.
    pub dispatches: u32,
}

impl Operator {
    pub fn new(kind: OpKind, region_id: RegionId, desc: &'static str, steps: Vec<OpStep>) -> Self {
        Self {
            kind,
            region_id,
            desc,
            steps,
            current: 0,
            dispatches: 0,
        }
    }

    /// Skips every step whose effect is already visible in `region` and
    /// returns the step to dispatch next, or `None` once all steps applied.
    pub fn advance(&mut self, region: &Region) -> Option<&OpStep> {
        while let Some(step) = self.steps.get(self.current) {
            if !step.is_applied(region) {
                break;
            }
            self.current += 1;
            self.dispatches = 0;
        }
        self.steps.get(self.current)
    }

    /// Steps not yet observed as applied.
    pub fn remaining(&self) -> &[OpStep] {
        self.steps.get(self.current..).unwrap_or(&[])
    }
}
