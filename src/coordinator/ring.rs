//! Consistent hash ring with virtual nodes
//!
//! Every storage node owns `V` positions on a 64-bit ring. A key is placed
//! at its own hash and served by the distinct nodes found walking clockwise
//! from there. Membership changes only move the keys adjacent to the
//! affected positions.

use crate::common::{ring_position, NodeId};
use std::collections::HashMap;

/// Default virtual nodes per storage node
pub const DEFAULT_VIRTUAL_NODES: usize = 128;

/// One position on the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNode {
    pub hash: u64,
    pub node: NodeId,
}

/// Ring of virtual nodes, always sorted by hash
#[derive(Debug, Clone)]
pub struct HashRing {
    vnodes_per_node: usize,
    ring: Vec<VirtualNode>,
    nodes: HashMap<NodeId, Vec<u64>>,
}

impl HashRing {
    pub fn new(vnodes_per_node: usize) -> Self {
        Self {
            vnodes_per_node: vnodes_per_node.max(1),
            ring: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    /// Add a node's virtual nodes. Returns false if it was already present.
    pub fn add_node(&mut self, node: &str) -> bool {
        if self.nodes.contains_key(node) {
            return false;
        }

        let mut points = Vec::with_capacity(self.vnodes_per_node);
        for i in 0..self.vnodes_per_node {
            let hash = ring_position(&format!("{}:{}", node, i));
            points.push(hash);
            self.ring.push(VirtualNode {
                hash,
                node: node.to_string(),
            });
        }
        // Ties on hash are broken by node id so ordering never depends on
        // insertion order.
        self.ring
            .sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.node.cmp(&b.node)));
        self.nodes.insert(node.to_string(), points);
        true
    }

    /// Remove a node and all of its virtual nodes (decommission).
    pub fn remove_node(&mut self, node: &str) -> bool {
        if self.nodes.remove(node).is_none() {
            return false;
        }
        self.ring.retain(|v| v.node != node);
        true
    }

    /// Up to `count` distinct nodes in ring-successor order from `key`.
    ///
    /// Starts at the first virtual node whose hash is >= the key's hash,
    /// wrapping past the end of the ring. Returns fewer than `count` nodes
    /// when the ring holds fewer.
    pub fn candidates(&self, key: &str, count: usize) -> Vec<NodeId> {
        let want = count.min(self.nodes.len());
        if want == 0 {
            return Vec::new();
        }

        let hash = ring_position(key);
        let start = self.ring.partition_point(|v| v.hash < hash);
        let len = self.ring.len();

        let mut selected: Vec<NodeId> = Vec::with_capacity(want);
        for offset in 0..len {
            let vnode = &self.ring[(start + offset) % len];
            if !selected.contains(&vnode.node) {
                selected.push(vnode.node.clone());
                if selected.len() == want {
                    break;
                }
            }
        }
        selected
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Member node ids, sorted
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.nodes.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Number of member nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn vnode_count(&self) -> usize {
        self.ring.len()
    }

    pub fn vnodes_per_node(&self) -> usize {
        self.vnodes_per_node
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Virtual nodes in ring order
    pub fn vnodes(&self) -> &[VirtualNode] {
        &self.ring
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}
