//! Node identity and the node registry (C3).

use std::fmt;

/// Lifecycle state of a data node, as tracked by the master (spec §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// Registered in the config/ring but has not yet completed `Register`.
    Down,
    /// Registered and has successfully called `Register`.
    Up,
    /// A client reported it unreachable and a master-issued `Ping` failed.
    Questionable,
    /// Being removed or resized; draining keys to their new rightful owners.
    Migrating,
}

impl NodeStatus {
    /// Maps to the single wire byte carried in a node descriptor (spec §4.3).
    pub fn to_wire(self) -> u8 {
        match self {
            NodeStatus::Down => 0,
            NodeStatus::Up => 1,
            NodeStatus::Questionable => 2,
            NodeStatus::Migrating => 3,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(NodeStatus::Down),
            1 => Some(NodeStatus::Up),
            2 => Some(NodeStatus::Questionable),
            3 => Some(NodeStatus::Migrating),
            _ => None,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            NodeStatus::Down => "down",
            NodeStatus::Up => "up",
            NodeStatus::Questionable => "questionable",
            NodeStatus::Migrating => "migrating",
        };
        write!(f, "{}", s)
    }
}

/// A single storage peer, addressed by its canonical `HOST:PORT` name
/// (spec §3 "Node").
#[derive(Clone, Debug)]
pub struct Node {
    pub host: String,
    pub port: i32,
    pub max_bytes: i64,
    pub status: NodeStatus,
    /// Virtual-node positions this node currently owns on the ring.
    pub locations: Vec<i32>,
}

impl Node {
    pub fn new(host: impl Into<String>, port: i32, max_bytes: i64) -> Self {
        Node {
            host: host.into(),
            port,
            max_bytes,
            status: NodeStatus::Down,
            locations: Vec::new(),
        }
    }

    /// The canonical identity of this node: `UPPERCASE(host) + ":" + port`.
    /// Two nodes are the same node iff their canonical names match (spec §3).
    pub fn canonical_name(&self) -> String {
        canonical_name(&self.host, self.port)
    }
}

/// Builds the canonical `UPPERCASE(host):port` identity string without
/// needing a full [`Node`] value — used by the master when it only has raw
/// `(host, port)` pairs off the wire.
pub fn canonical_name(host: &str, port: i32) -> String {
    format!("{}:{}", host.to_uppercase(), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_uppercases_host_only() {
        assert_eq!(canonical_name("db-1.internal", 11211), "DB-1.INTERNAL:11211");
    }

    #[test]
    fn status_wire_roundtrip() {
        for status in [
            NodeStatus::Down,
            NodeStatus::Up,
            NodeStatus::Questionable,
            NodeStatus::Migrating,
        ] {
            assert_eq!(NodeStatus::from_wire(status.to_wire()), Some(status));
        }
    }
}
