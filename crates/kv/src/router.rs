//! Key placement: maps a key to an ordered set of responsible nodes.
//!
//! Every node is hashed onto a 64-bit ring at `virtual_nodes` positions. A
//! key's replica set is the first N distinct nodes met walking clockwise
//! from the key's own position. The ring is built once from the static
//! topology, so placement is a pure function of (key, topology).

use ringkv_common::NodeId;
use sha1::{Digest, Sha1};
use std::collections::HashSet;

/// Ring positions per node unless configured otherwise.
pub const DEFAULT_VIRTUAL_NODES: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("cluster topology is empty")]
    EmptyTopology,
    #[error("node {0} appears twice in the topology")]
    DuplicateNode(NodeId),
    #[error("virtual node count must be at least 1")]
    NoVirtualNodes,
}

/// Position of arbitrary bytes on the ring: the first 8 bytes of their
/// SHA-1 digest, big-endian.
pub fn ring_position(bytes: &[u8]) -> u64 {
    let digest = Sha1::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

fn virtual_position(node: &NodeId, index: usize) -> u64 {
    ring_position(format!("{}#{}", node, index).as_bytes())
}

#[derive(Debug, Clone)]
pub struct Router {
    nodes: Vec<NodeId>,
    /// (position, index into `nodes`), sorted. Ties order by node index so
    /// the walk stays deterministic even on a hash collision.
    ring: Vec<(u64, usize)>,
}

impl Router {
    pub fn new(topology: Vec<NodeId>, virtual_nodes: usize) -> Result<Self, RouterError> {
        if topology.is_empty() {
            return Err(RouterError::EmptyTopology);
        }
        if virtual_nodes == 0 {
            return Err(RouterError::NoVirtualNodes);
        }
        let mut seen = HashSet::new();
        for node in &topology {
            if !seen.insert(node) {
                return Err(RouterError::DuplicateNode(node.clone()));
            }
        }

        let mut ring = Vec::with_capacity(topology.len() * virtual_nodes);
        for (idx, node) in topology.iter().enumerate() {
            for v in 0..virtual_nodes {
                ring.push((virtual_position(node, v), idx));
            }
        }
        ring.sort_unstable();

        Ok(Self {
            nodes: topology,
            ring,
        })
    }

    /// The topology in the order it was supplied.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// The ordered replica set for `key`: exactly `min(n, cluster_size)`
    /// distinct nodes. The first entry is the key's primary.
    pub fn replicas_for(&self, key: &[u8], n: usize) -> Vec<NodeId> {
        let want = n.min(self.nodes.len());
        let mut replicas = Vec::with_capacity(want);
        if want == 0 {
            return replicas;
        }

        let pos = ring_position(key);
        let start = self.ring.partition_point(|&(p, _)| p < pos);
        let mut taken = vec![false; self.nodes.len()];

        for i in 0..self.ring.len() {
            let (_, idx) = self.ring[(start + i) % self.ring.len()];
            if !taken[idx] {
                taken[idx] = true;
                replicas.push(self.nodes[idx].clone());
                if replicas.len() == want {
                    break;
                }
            }
        }
        replicas
    }
}
