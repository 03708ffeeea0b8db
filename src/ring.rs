//! The consistent-hash ring and virtual-node placement algorithm (C2).
//!
//! Keys and virtual node positions both live in the same signed 32-bit
//! space. A key's owner is the node whose nearest virtual position lies at
//! or after the key's hash, walking clockwise and wrapping at the `i32`
//! boundary. Placement is pure with respect to the node set: re-running it
//! on the same `(host, port, maxBytes)` triples always yields the same
//! position set, which is what lets every peer derive the ring independently
//! from a minimal node descriptor (spec §4.2).

use std::collections::BTreeMap;

use crate::hash::loop_hash;
use crate::node::{canonical_name, Node, NodeStatus};

/// Virtual positions assigned per real node is proportional to capacity;
/// this is the total virtual-node budget divided across the cluster,
/// expressed as a multiplier on the node count (spec §4.2 step 3).
const VIRTUAL_NODES_PER_REAL_NODE: usize = 100;

/// Maximum number of linear-probe attempts when a candidate position
/// collides with one already on the ring. Exceeding this is a fatal
/// invariant violation (spec §4.2 step 5, §7).
const MAX_COLLISION_PROBES: u32 = 100;

/// The authoritative mapping of node name -> [`Node`], plus the derived
/// sorted position map used for ownership lookups (spec §3 "Ring").
#[derive(Clone, Debug, Default)]
pub struct Ring {
    nodes: BTreeMap<String, Node>,
    sorted_locations: BTreeMap<i32, String>,
}

/// Raised when [`Ring::run_placement`] cannot find a free position for a
/// virtual node within the allowed number of probes. This can only happen if
/// an internal invariant (e.g. more virtual nodes than available `i32`
/// values) has been violated; per spec §7 it is meant to abort the process,
/// not be recovered from request-by-request.
#[derive(Debug)]
pub struct PlacementCollisionError {
    pub host: String,
    pub port: i32,
    pub index: usize,
}

impl std::fmt::Display for PlacementCollisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "could not place virtual node {} for {}:{} after {} probes",
            self.index, self.host, self.port, MAX_COLLISION_PROBES
        )
    }
}

impl std::error::Error for PlacementCollisionError {}

impl Ring {
    pub fn new() -> Self {
        Ring::default()
    }

    /// Builds a ring from a set of nodes, immediately running placement.
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self, PlacementCollisionError> {
        let mut ring = Ring::new();
        for node in nodes {
            ring.nodes.insert(node.canonical_name(), node);
        }
        ring.run_placement()?;
        Ok(ring)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn sorted_locations(&self) -> &BTreeMap<i32, String> {
        &self.sorted_locations
    }

    /// Inserts a new node (status `Down` until it registers) and rebuilds
    /// placement. Returns `false` if a node with this canonical name already
    /// exists (the caller is responsible for turning that into `NodeExists`).
    pub fn add_node(&mut self, node: Node) -> Result<bool, PlacementCollisionError> {
        let name = node.canonical_name();
        if self.nodes.contains_key(&name) {
            return Ok(false);
        }
        self.nodes.insert(name, node);
        self.run_placement()?;
        Ok(true)
    }

    /// Removes a node by canonical name and rebuilds placement. Returns
    /// `false` if no such node existed.
    pub fn remove_node(&mut self, name: &str) -> Result<bool, PlacementCollisionError> {
        if self.nodes.remove(name).is_none() {
            return Ok(false);
        }
        self.run_placement()?;
        Ok(true)
    }

    /// Changes a node's capacity and rebuilds placement, since capacity
    /// changes shift the proportional position assignment for every node,
    /// not just the one being resized.
    pub fn change_node_capacity(
        &mut self,
        name: &str,
        max_bytes: i64,
    ) -> Result<bool, PlacementCollisionError> {
        let Some(node) = self.nodes.get_mut(name) else {
            return Ok(false);
        };
        node.max_bytes = max_bytes;
        self.run_placement()?;
        Ok(true)
    }

    /// Replaces the node set wholesale (used by a data node absorbing a
    /// minimal ring descriptor from the master) and rebuilds placement.
    pub fn replace_nodes(&mut self, nodes: Vec<Node>) -> Result<(), PlacementCollisionError> {
        self.nodes.clear();
        for node in nodes {
            self.nodes.insert(node.canonical_name(), node);
        }
        self.run_placement()
    }

    /// The placement algorithm (spec §4.2): clears all positions, then for
    /// every node assigns a number of virtual positions proportional to its
    /// share of total cluster capacity, deterministically named
    /// `"{host}_{port}_{i}"`, probing forward on collision.
    pub fn run_placement(&mut self) -> Result<(), PlacementCollisionError> {
        self.sorted_locations.clear();
        for node in self.nodes.values_mut() {
            node.locations.clear();
        }

        let total_memory: i64 = self.nodes.values().map(|n| n.max_bytes).sum();
        if total_memory <= 0 || self.nodes.is_empty() {
            return Ok(());
        }

        let target_virtual_nodes = VIRTUAL_NODES_PER_REAL_NODE * self.nodes.len();

        // Collect the work up front so we don't hold a mutable borrow of
        // `self.nodes` while also writing into `self.sorted_locations`.
        let assignments: Vec<(String, String, i32, usize)> = self
            .nodes
            .values()
            .map(|n| {
                let share = (target_virtual_nodes as f64) * (n.max_bytes as f64) / (total_memory as f64);
                (
                    n.canonical_name(),
                    n.host.clone(),
                    n.port,
                    share.round() as usize,
                )
            })
            .collect();

        for (name, host, port, num_locations) in assignments {
            for i in 0..num_locations {
                let mut candidate = loop_hash(&format!("{}_{}_{}", host, port, i));
                let mut probes = 0u32;
                while self.sorted_locations.contains_key(&candidate) {
                    probes += 1;
                    if probes > MAX_COLLISION_PROBES {
                        return Err(PlacementCollisionError {
                            host: host.clone(),
                            port,
                            index: i,
                        });
                    }
                    candidate = candidate.wrapping_add(1);
                }

                self.sorted_locations.insert(candidate, name.clone());
                self.nodes.get_mut(&name).unwrap().locations.push(candidate);
            }
        }

        Ok(())
    }

    /// Finds the owning node's canonical name for a given ring position,
    /// wrapping clockwise at the `i32` boundary (spec §4.2 "Lookup").
    pub fn owner_name_for_hash(&self, h: i32) -> Option<&str> {
        if let Some((_, name)) = self.sorted_locations.range(h..).next() {
            return Some(name.as_str());
        }
        self.sorted_locations.values().next().map(|s| s.as_str())
    }

    /// Finds the owning node for a given key.
    pub fn owner_for_key(&self, key: &str) -> Option<&Node> {
        let h = loop_hash(key);
        let name = self.owner_name_for_hash(h)?;
        self.nodes.get(name)
    }

    /// Marks a node `Questionable` without touching placement (used by the
    /// master's `NodeUnreachable` handler, spec §4.6).
    pub fn mark_questionable(&mut self, name: &str) -> bool {
        if let Some(node) = self.nodes.get_mut(name) {
            node.status = NodeStatus::Questionable;
            true
        } else {
            false
        }
    }

    pub fn set_status(&mut self, name: &str, status: NodeStatus) -> bool {
        if let Some(node) = self.nodes.get_mut(name) {
            node.status = status;
            true
        } else {
            false
        }
    }

    /// Looks up a node by its raw `(host, port)` pair, applying the same
    /// canonicalization rule as registration.
    pub fn get_by_host_port(&self, host: &str, port: i32) -> Option<&Node> {
        self.nodes.get(&canonical_name(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_ring() -> Ring {
        Ring::from_nodes(vec![
            Node::new("node-a", 1, 48 * 1024 * 1024),
            Node::new("node-b", 2, 12 * 1024 * 1024),
            Node::new("node-c", 3, 64 * 1024 * 1024),
        ])
        .expect("placement should not collide for three distinct nodes")
    }

    #[test]
    fn placement_is_deterministic() {
        let a = three_node_ring();
        let mut b = three_node_ring();
        b.run_placement().unwrap();

        assert_eq!(a.sorted_locations(), b.sorted_locations());
        for name in ["NODE-A:1", "NODE-B:2", "NODE-C:3"] {
            assert_eq!(
                a.get(name).unwrap().locations,
                b.get(name).unwrap().locations
            );
        }
    }

    #[test]
    fn every_position_round_trips_to_its_owning_node() {
        let ring = three_node_ring();
        for (&pos, name) in ring.sorted_locations() {
            assert!(ring.get(name).unwrap().locations.contains(&pos));
        }
    }

    #[test]
    fn lookup_wraps_at_the_top_of_the_ring() {
        let ring = three_node_ring();
        let max_pos = *ring.sorted_locations().keys().next_back().unwrap();
        let first_owner = ring.sorted_locations().values().next().unwrap().clone();
        assert_eq!(ring.owner_name_for_hash(max_pos), Some(first_owner.as_str()));
        assert_eq!(
            ring.owner_name_for_hash(i32::MAX),
            Some(first_owner.as_str())
        );
    }

    #[test]
    fn proportional_load_is_monotone_in_capacity() {
        let ring = three_node_ring();
        let mut counts = std::collections::HashMap::new();
        for i in 0..100_000 {
            let key = format!("proportional-key-{}", i);
            let owner = ring.owner_for_key(&key).unwrap().canonical_name();
            *counts.entry(owner).or_insert(0usize) += 1;
        }

        let a = counts.get("NODE-A:1").copied().unwrap_or(0);
        let b = counts.get("NODE-B:2").copied().unwrap_or(0);
        let c = counts.get("NODE-C:3").copied().unwrap_or(0);

        // capacities were 48Mb / 12Mb / 64Mb -- ownership should follow the
        // same order.
        assert!(b < a, "smallest node should own the fewest keys");
        assert!(a < c, "largest node should own the most keys");
    }

    #[test]
    fn rebalance_is_not_total_after_a_capacity_change() {
        let mut ring = three_node_ring();
        let keys: Vec<String> = (0..100_000).map(|i| format!("rebalance-key-{}", i)).collect();

        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.owner_for_key(k).unwrap().canonical_name())
            .collect();

        ring.change_node_capacity("NODE-C:3", 48 * 1024 * 1024).unwrap();

        let changed = keys
            .iter()
            .zip(before.iter())
            .filter(|(k, old_owner)| {
                ring.owner_for_key(k).unwrap().canonical_name() != **old_owner
            })
            .count();

        assert!(changed < keys.len(), "not every key should change owner");
        assert!(changed > 0, "some key ownership should shift");
    }
}
