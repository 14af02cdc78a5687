//! Cluster topology snapshots and hash-slot routing.
//!
//! Topology discovery is not done here. A [`TopologySource`] reports the
//! current primaries; callers re-read it on every access rather than caching
//! it, so a snapshot always reflects the latest state the source knows of.

use std::sync::{PoisonError, RwLock};

/// Number of hash slots in the keyspace.
pub const SLOT_COUNT: u16 = 16_384;

/// Inclusive range of hash slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// A primary node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNode {
    /// Stable node name; snapshots are ordered by it.
    pub name: String,
    /// `host:port` the node serves RESP on.
    pub addr: String,
    pub slots: Vec<SlotRange>,
}

impl ClusterNode {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            slots: Vec::new(),
        }
    }

    pub fn with_slots(mut self, slots: Vec<SlotRange>) -> Self {
        self.slots = slots;
        self
    }

    pub fn serves(&self, slot: u16) -> bool {
        self.slots.iter().any(|range| range.contains(slot))
    }
}

/// Reports the current set of primaries.
pub trait TopologySource: Send + Sync {
    /// Current primaries in any order.
    fn primaries(&self) -> Vec<ClusterNode>;

    /// Current primaries ordered by name.
    fn sorted_primaries(&self) -> Vec<ClusterNode> {
        let mut nodes = self.primaries();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }
}

/// A topology supplied by the application and replaced wholesale whenever
/// its own discovery learns of a change.
#[derive(Debug, Default)]
pub struct StaticTopology {
    nodes: RwLock<Vec<ClusterNode>>,
}

impl StaticTopology {
    pub fn new(nodes: Vec<ClusterNode>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Nodes given as `(name, addr)` pairs, with the slot space split evenly
    /// between them in name order.
    pub fn evenly_split<N, A>(nodes: impl IntoIterator<Item = (N, A)>) -> Self
    where
        N: Into<String>,
        A: Into<String>,
    {
        let mut nodes: Vec<ClusterNode> = nodes
            .into_iter()
            .map(|(name, addr)| ClusterNode::new(name, addr))
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let count = nodes.len() as u32;
        for (idx, node) in nodes.iter_mut().enumerate() {
            let idx = idx as u32;
            let start = idx * SLOT_COUNT as u32 / count;
            let end = (idx + 1) * SLOT_COUNT as u32 / count - 1;
            node.slots = vec![SlotRange::new(start as u16, end as u16)];
        }
        Self::new(nodes)
    }

    /// Swap in a new snapshot.
    pub fn replace(&self, nodes: Vec<ClusterNode>) {
        let mut guard = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            before = guard.len(),
            after = nodes.len(),
            "cluster topology replaced"
        );
        *guard = nodes;
    }
}

impl TopologySource for StaticTopology {
    fn primaries(&self) -> Vec<ClusterNode> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Hash slot of `key`, honouring `{hash tags}`.
pub fn key_slot(key: &[u8]) -> u16 {
    redis_protocol::redis_keyslot(key)
}

/// The primary in `nodes` that serves `slot`.
pub fn node_for_slot(nodes: &[ClusterNode], slot: u16) -> Option<&ClusterNode> {
    nodes.iter().find(|node| node.serves(slot))
}
