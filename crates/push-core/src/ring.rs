//! Weighted consistent-hash ring (ketama style)
//!
//! Every staged node contributes `replica_base * weight` points. A point is
//! the first 8 bytes (big endian) of SHA-256 over `"<node>-<index>"`, so a
//! node/index pair always lands on the same spot and adding or removing a
//! node only moves the keys adjacent to its own points.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Default number of points per unit of weight
pub const REPLICA_BASE: u32 = 255;

/// One virtual point on the ring
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RingPoint {
    pub hash: u64,
    pub node: Arc<str>,
}

/// Consistent-hash ring
///
/// Nodes are staged with [`Ring::add_node`] and become visible after
/// [`Ring::bake`]. A baked ring is never mutated by lookups.
#[derive(Debug, Clone)]
pub struct Ring {
    replica_base: u32,
    staged: Vec<(Arc<str>, u32)>,
    points: Vec<RingPoint>,
}

impl Default for Ring {
    fn default() -> Self {
        Self::new(REPLICA_BASE)
    }
}

impl Ring {
    pub fn new(replica_base: u32) -> Self {
        Self {
            replica_base: replica_base.max(1),
            staged: Vec::new(),
            points: Vec::new(),
        }
    }

    /// Build and bake a ring from a node -> weight map
    pub fn from_weights(weights: &HashMap<String, u32>) -> Self {
        let mut ring = Self::default();
        for (node, weight) in weights {
            ring.add_node(node, *weight);
        }
        ring.bake();
        ring
    }

    /// Stage a node; weights below 1 count as 1
    pub fn add_node(&mut self, node: &str, weight: u32) {
        self.staged.retain(|(id, _)| id.as_ref() != node);
        self.staged.push((Arc::from(node), weight.max(1)));
    }

    /// Regenerate and sort the point table from the staged nodes
    pub fn bake(&mut self) {
        let total: usize = self
            .staged
            .iter()
            .map(|(_, w)| (*w as usize) * self.replica_base as usize)
            .sum();
        let mut points = Vec::with_capacity(total);
        for (node, weight) in &self.staged {
            let spots = self.replica_base * weight;
            for i in 1..=spots {
                points.push(RingPoint {
                    hash: digest(format!("{}-{}", node, i).as_bytes()),
                    node: node.clone(),
                });
            }
        }
        // (hash, node) ordering keeps equal hashes independent of staging order
        points.sort_unstable();
        self.points = points;
    }

    /// Owning node of `key`, `None` on an empty ring
    pub fn hash(&self, key: &str) -> Option<&str> {
        self.locate(digest(key.as_bytes()))
    }

    fn locate(&self, value: u64) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|p| p.hash < value);
        let point = if idx == self.points.len() {
            &self.points[0]
        } else {
            &self.points[idx]
        };
        Some(point.node.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether `node` owns points in the baked table
    pub fn contains(&self, node: &str) -> bool {
        self.staged.iter().any(|(id, _)| id.as_ref() == node) && !self.points.is_empty()
    }

    /// Node -> weight of every staged node
    pub fn weights(&self) -> HashMap<String, u32> {
        self.staged
            .iter()
            .map(|(id, w)| (id.to_string(), *w))
            .collect()
    }
}

fn digest(data: &[u8]) -> u64 {
    let hash = Sha256::digest(data);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(buf)
}
