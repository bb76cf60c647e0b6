//! Replica placement on top of the hash ring
//!
//! Candidates come from the ring in successor order and are filtered by
//! liveness. Dead nodes keep their virtual nodes, so the window is widened
//! (R, R+2, ...) until enough live nodes are found or the ring is exhausted.

use crate::common::{Clock, Error, NodeId, Result};
use crate::coordinator::liveness::LivenessTracker;
use crate::coordinator::ring::HashRing;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// How many replicas a chunk needs and how many acks make it durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementPolicy {
    /// Replication factor (R)
    pub replicas: usize,
    /// Write quorum (W), `1..=R`
    pub write_quorum: usize,
    /// Accept fewer than R live candidates as long as W are live
    pub allow_under_replication: bool,
}

impl PlacementPolicy {
    pub fn new(replicas: usize, write_quorum: usize) -> Self {
        let replicas = replicas.max(1);
        Self {
            replicas,
            write_quorum: write_quorum.clamp(1, replicas),
            allow_under_replication: false,
        }
    }
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self::new(2, 2)
    }
}

/// PlacementManager picks live replica sets for chunks.
pub struct PlacementManager {
    ring: RwLock<HashRing>,
    liveness: Arc<LivenessTracker>,
    clock: Arc<dyn Clock>,
    policy: PlacementPolicy,
}

impl PlacementManager {
    pub fn new(
        ring: HashRing,
        liveness: Arc<LivenessTracker>,
        clock: Arc<dyn Clock>,
        policy: PlacementPolicy,
    ) -> Self {
        Self {
            ring: RwLock::new(ring),
            liveness,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.liveness
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Live nodes a chunk should be written to, in ring order.
    ///
    /// Returns exactly R nodes, or between W and R when under-replication
    /// is allowed. Anything less is `InsufficientReplicas`.
    pub fn write_targets(&self, chunk_index: u64, chunk_id: &str) -> Result<Vec<NodeId>> {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let wanted = self.policy.replicas;
        let total = ring.len();

        let mut window = wanted;
        let live = loop {
            let live: Vec<NodeId> = ring
                .candidates(chunk_id, window)
                .into_iter()
                .filter(|node| self.liveness.is_live(node, now))
                .collect();
            if live.len() >= wanted || window >= total {
                break live;
            }
            window = (window + 2).min(total);
        };

        if live.len() >= wanted {
            return Ok(live.into_iter().take(wanted).collect());
        }
        if self.policy.allow_under_replication && live.len() >= self.policy.write_quorum {
            tracing::warn!(
                chunk = chunk_index,
                live = live.len(),
                replicas = wanted,
                "placing chunk under-replicated"
            );
            return Ok(live);
        }

        Err(Error::InsufficientReplicas {
            chunk: chunk_index,
            needed: wanted,
            available: live.len(),
        })
    }

    /// Further live nodes for a chunk, in ring order, skipping `attempted`.
    pub fn spare_targets(&self, chunk_id: &str, attempted: &HashSet<NodeId>) -> Vec<NodeId> {
        self.live_successors(chunk_id, attempted)
    }

    /// Fresh live candidates for reading a chunk whose stored replicas
    /// all failed.
    pub fn fallback_candidates(&self, chunk_id: &str, tried: &HashSet<NodeId>) -> Vec<NodeId> {
        self.live_successors(chunk_id, tried)
    }

    /// Sort `nodes` by their distance from the chunk's ring position.
    pub fn ring_order(&self, chunk_id: &str, nodes: &mut [NodeId]) {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        let order = ring.candidates(chunk_id, ring.len());
        nodes.sort_by_key(|node| {
            order
                .iter()
                .position(|candidate| candidate == node)
                .unwrap_or(usize::MAX)
        });
    }

    pub fn is_live(&self, node: &str) -> bool {
        self.liveness.is_live(node, self.clock.now())
    }

    pub fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.liveness.snapshot_live(self.clock.now())
    }

    /// Put a node on the ring. No-op if it is already a member.
    pub fn add_node(&self, node: &str) -> bool {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        ring.add_node(node)
    }

    /// Take a node off the ring entirely. Only decommission does this;
    /// a timed-out node stays on the ring.
    pub fn remove_node(&self, node: &str) -> bool {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        ring.remove_node(node)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node)
    }

    pub fn ring_nodes(&self) -> Vec<NodeId> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes()
    }

    pub fn vnode_count(&self) -> usize {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .vnode_count()
    }

    fn live_successors(&self, chunk_id: &str, exclude: &HashSet<NodeId>) -> Vec<NodeId> {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        ring.candidates(chunk_id, ring.len())
            .into_iter()
            .filter(|node| !exclude.contains(node) && self.liveness.is_live(node, now))
            .collect()
    }
}
