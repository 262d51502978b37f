//! Per-shard registry of running plans.
//!
//! One `StreamManager` is built for every shard and moved into that shard's
//! command loop, which is the only code that ever touches it.

use crate::error::{Result, StreamError};
use crate::streaming::coordinator::{StreamOutcome, StreamResultFuture};
use crate::streaming::types::{PlanId, StreamState};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Which registry a plan lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Started by this node.
    Initiated,
    /// Opened by a peer.
    Receiving,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Initiated => "initiated",
            PlanKind::Receiving => "receiving",
        }
    }
}

pub struct StreamManager {
    shard_id: usize,
    initiated: BTreeMap<PlanId, StreamResultFuture>,
    receiving: BTreeMap<PlanId, StreamResultFuture>,
}

impl StreamManager {
    pub fn new(shard_id: usize) -> Self {
        Self {
            shard_id,
            initiated: BTreeMap::new(),
            receiving: BTreeMap::new(),
        }
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    fn map(&self, kind: PlanKind) -> &BTreeMap<PlanId, StreamResultFuture> {
        match kind {
            PlanKind::Initiated => &self.initiated,
            PlanKind::Receiving => &self.receiving,
        }
    }

    fn map_mut(&mut self, kind: PlanKind) -> &mut BTreeMap<PlanId, StreamResultFuture> {
        match kind {
            PlanKind::Initiated => &mut self.initiated,
            PlanKind::Receiving => &mut self.receiving,
        }
    }

    fn register(
        &mut self,
        kind: PlanKind,
        coordinator: StreamResultFuture,
    ) -> Result<&mut StreamResultFuture> {
        let plan_id = coordinator.plan_id();
        let shard_id = self.shard_id;
        let map = self.map_mut(kind);
        if map.contains_key(&plan_id) {
            return Err(StreamError::DuplicatePlan {
                plan_id,
                kind: kind.as_str(),
            });
        }
        info!(shard = shard_id, plan_id = %plan_id, kind = kind.as_str(), "Registered stream plan");
        Ok(map.entry(plan_id).or_insert(coordinator))
    }

    pub fn register_initiated(
        &mut self,
        coordinator: StreamResultFuture,
    ) -> Result<&mut StreamResultFuture> {
        self.register(PlanKind::Initiated, coordinator)
    }

    pub fn register_receiving(
        &mut self,
        coordinator: StreamResultFuture,
    ) -> Result<&mut StreamResultFuture> {
        self.register(PlanKind::Receiving, coordinator)
    }

    pub fn get_mut(&mut self, kind: PlanKind, plan_id: &PlanId) -> Option<&mut StreamResultFuture> {
        self.map_mut(kind).get_mut(plan_id)
    }

    /// Remove a plan whose coordinator is terminal. Running plans stay put.
    pub fn unregister(&mut self, kind: PlanKind, plan_id: &PlanId) -> Result<StreamResultFuture> {
        let shard_id = self.shard_id;
        let map = self.map_mut(kind);
        let terminal = match map.get(plan_id) {
            None => return Err(StreamError::UnknownPlan(*plan_id)),
            Some(c) => c.is_terminal(),
        };
        if !terminal {
            return Err(StreamError::PlanStillRunning(*plan_id));
        }
        debug!(shard = shard_id, plan_id = %plan_id, kind = kind.as_str(), "Unregistered stream plan");
        map.remove(plan_id)
            .ok_or(StreamError::UnknownPlan(*plan_id))
    }

    /// A session of `plan_id` reached a terminal state. Once the whole plan
    /// is terminal its outcome is returned and the plan is unregistered.
    pub fn session_finished(&mut self, plan_id: &PlanId) -> Vec<StreamOutcome> {
        let mut outcomes = Vec::new();
        for kind in [PlanKind::Initiated, PlanKind::Receiving] {
            let Some(coordinator) = self.get_mut(kind, plan_id) else {
                continue;
            };
            if let Some(outcome) = coordinator.finish() {
                outcomes.push(outcome);
                let _ = self.unregister(kind, plan_id);
            }
        }
        outcomes
    }

    pub fn list_initiated(&self) -> impl Iterator<Item = (&PlanId, &StreamResultFuture)> {
        self.initiated.iter()
    }

    pub fn list_receiving(&self) -> impl Iterator<Item = (&PlanId, &StreamResultFuture)> {
        self.receiving.iter()
    }

    /// This shard's contribution to the global view: initiated plans first,
    /// then receiving ones, each in plan id order.
    pub fn snapshot_all(&self) -> Vec<StreamState> {
        self.list_initiated()
            .chain(self.list_receiving())
            .map(|(_, c)| c.snapshot())
            .collect()
    }

    /// Abort a plan in whichever registry holds it.
    pub fn abort(&self, plan_id: &PlanId) -> Result<()> {
        let mut found = false;
        for kind in [PlanKind::Initiated, PlanKind::Receiving] {
            if let Some(c) = self.map(kind).get(plan_id) {
                c.abort();
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(StreamError::UnknownPlan(*plan_id))
        }
    }

    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for (_, c) in self.list_initiated().chain(self.list_receiving()) {
            c.abort();
            aborted += 1;
        }
        aborted
    }

    pub fn len(&self) -> usize {
        self.initiated.len() + self.receiving.len()
    }

    pub fn is_empty(&self) -> bool {
        self.initiated.is_empty() && self.receiving.is_empty()
    }
}
