//! Cluster Membership Store
//!
//! Ordered set of known peers and their reachability. Insertion order is
//! the peers file order and is the only input the balancer uses, so it
//! must be identical on every node.

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::PeerLink;

/// Fixed offset between a node's client port and its bus port
pub const BUS_PORT_OFFSET: u16 = 100;

/// Peer reachability as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    /// No bus link established yet
    Unreachable,
    /// Bus link established (or the node is us)
    Reachable,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Unreachable => write!(f, "UNREACHABLE"),
            Reachability::Reachable => write!(f, "REACHABLE"),
        }
    }
}

/// Half-open slot range `[min, max)` owned by one member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub min: u64,
    pub max: u64,
}

impl SlotRange {
    /// Number of slots in the range
    pub fn len(&self) -> u64 {
        self.max - self.min
    }

    pub fn is_empty(&self) -> bool {
        self.max == self.min
    }

    /// Check if a slot falls inside the range
    pub fn contains(&self, slot: u64) -> bool {
        slot >= self.min && slot < self.max
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// One cluster member as known to this process
#[derive(Debug)]
pub struct PeerNode {
    /// Operator-assigned name, not guaranteed unique
    pub name: String,
    /// Client traffic address
    pub address: String,
    /// Client traffic port
    pub client_port: u16,
    /// True for the local node only
    pub is_self: bool,
    /// Current reachability
    pub reachability: Reachability,
    /// Owned bus link, present only when reachable and not self
    pub link: Option<PeerLink>,
    /// Partition assigned by the balancer
    pub range: Option<SlotRange>,
    /// When the node last became reachable
    pub reachable_since: Option<chrono::DateTime<chrono::Utc>>,
}

impl PeerNode {
    /// Create a remote peer, initially unreachable
    pub fn new(name: impl Into<String>, address: impl Into<String>, client_port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            client_port,
            is_self: false,
            reachability: Reachability::Unreachable,
            link: None,
            range: None,
            reachable_since: None,
        }
    }

    /// Create the entry for the local node
    pub fn local(name: impl Into<String>, address: impl Into<String>, client_port: u16) -> Self {
        Self {
            is_self: true,
            reachability: Reachability::Reachable,
            reachable_since: Some(chrono::Utc::now()),
            ..Self::new(name, address, client_port)
        }
    }

    /// Inter-node port
    pub fn bus_port(&self) -> u16 {
        self.client_port.saturating_add(BUS_PORT_OFFSET)
    }

    /// Check if this entry has the given identity key
    pub fn has_key(&self, address: &str, client_port: u16) -> bool {
        self.address == address && self.client_port == client_port
    }

    /// Cloneable view without the link
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            name: self.name.clone(),
            address: self.address.clone(),
            client_port: self.client_port,
            bus_port: self.bus_port(),
            is_self: self.is_self,
            reachability: self.reachability,
            linked: self.link.is_some(),
            range: self.range,
            reachable_since: self.reachable_since,
        }
    }
}

/// Snapshot of a member for logging and reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub address: String,
    pub client_port: u16,
    pub bus_port: u16,
    pub is_self: bool,
    pub reachability: Reachability,
    pub linked: bool,
    pub range: Option<SlotRange>,
    pub reachable_since: Option<chrono::DateTime<chrono::Utc>>,
}

/// Result of inserting a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Appended as a new member at this index
    Added(usize),
    /// The node was us; the self entry moved to this index
    SelfPlaced(usize),
}

/// Ordered cluster membership
#[derive(Debug)]
pub struct Membership {
    nodes: Vec<PeerNode>,
    self_placed: bool,
}

impl Membership {
    /// Create a membership holding only the local node
    pub fn new(local: PeerNode) -> Self {
        debug_assert!(local.is_self);
        Self {
            nodes: vec![local],
            self_placed: false,
        }
    }

    /// Append a node.
    ///
    /// Members are keyed by `(address, client_port)`. A node carrying the
    /// local key moves the self entry to the end instead of adding a second
    /// copy, so a peers file that lists every node produces the same order
    /// on every process. That happens once; any other repeated key is
    /// rejected, as is any node flagged as local.
    pub fn add_node(&mut self, node: PeerNode) -> Result<Admission> {
        if node.is_self {
            return Err(Error::Config(format!(
                "{} ({}:{}) claims to be the local node",
                node.name, node.address, node.client_port
            )));
        }

        let Some(existing) = self.position(&node.address, node.client_port) else {
            self.nodes.push(node);
            return Ok(Admission::Added(self.nodes.len() - 1));
        };

        if self.nodes[existing].is_self && !self.self_placed {
            self.self_placed = true;
            let local = self.nodes.remove(existing);
            self.nodes.push(local);
            return Ok(Admission::SelfPlaced(self.nodes.len() - 1));
        }

        Err(Error::DuplicateMember {
            address: node.address,
            port: node.client_port,
        })
    }

    /// True iff the node is us or has a live bus link
    pub fn is_reachable(node: &PeerNode) -> bool {
        node.is_self || node.reachability == Reachability::Reachable
    }

    /// Number of members that still need a bus link
    pub fn unreachable_count(&self) -> usize {
        self.nodes.iter().filter(|n| !Self::is_reachable(n)).count()
    }

    /// Record a successful handshake, taking ownership of the link
    pub fn update_reachability(&mut self, index: usize, link: PeerLink) -> Result<()> {
        let node = self
            .nodes
            .get_mut(index)
            .ok_or_else(|| Error::NodeNotFound(format!("member #{}", index)))?;

        if node.is_self {
            return Ok(());
        }

        if node.reachability == Reachability::Unreachable {
            node.reachable_since = Some(chrono::Utc::now());
        }
        node.reachability = Reachability::Reachable;
        node.link = Some(link);
        Ok(())
    }

    /// Index of the member with the given key
    pub fn position(&self, address: &str, client_port: u16) -> Option<usize> {
        self.nodes.iter().position(|n| n.has_key(address, client_port))
    }

    /// Index of the local node
    pub fn self_index(&self) -> usize {
        self.nodes.iter().position(|n| n.is_self).unwrap_or(0)
    }

    pub fn get(&self, index: usize) -> Option<&PeerNode> {
        self.nodes.get(index)
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [PeerNode] {
        &mut self.nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Cloned view of every member in order
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.nodes.iter().map(PeerNode::info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::loopback_link;

    fn three_node_membership() -> Membership {
        let mut membership = Membership::new(PeerNode::local("A", "10.0.0.1", 6379));
        membership.add_node(PeerNode::new("B", "10.0.0.2", 6380)).unwrap();
        membership.add_node(PeerNode::new("C", "10.0.0.3", 6381)).unwrap();
        membership
    }

    #[test]
    fn test_unreachable_count_excludes_self() {
        let membership = three_node_membership();
        assert_eq!(membership.len(), 3);
        assert_eq!(membership.unreachable_count(), 2);

        let expected = membership
            .iter()
            .filter(|n| !n.is_self && n.reachability == Reachability::Unreachable)
            .count();
        assert_eq!(membership.unreachable_count(), expected);
    }

    #[test]
    fn test_exactly_one_self_and_reachable() {
        let membership = three_node_membership();
        let selves: Vec<_> = membership.iter().filter(|n| n.is_self).collect();
        assert_eq!(selves.len(), 1);
        assert!(Membership::is_reachable(selves[0]));
        assert!(selves[0].link.is_none());
    }

    #[test]
    fn test_bus_port_offset() {
        let node = PeerNode::new("B", "10.0.0.2", 6380);
        assert_eq!(node.bus_port(), 6480);
        assert_ne!(node.bus_port(), node.client_port);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut membership = three_node_membership();
        let result = membership.add_node(PeerNode::new("B2", "10.0.0.2", 6380));
        assert!(matches!(result, Err(Error::DuplicateMember { port: 6380, .. })));
        assert_eq!(membership.len(), 3);

        // Same address on another port is a different member
        let added = membership.add_node(PeerNode::new("B3", "10.0.0.2", 6390)).unwrap();
        assert_eq!(added, Admission::Added(3));
    }

    #[test]
    fn test_self_key_moves_self_entry() {
        let mut membership = Membership::new(PeerNode::local("B", "10.0.0.2", 6380));
        membership.add_node(PeerNode::new("A", "10.0.0.1", 6379)).unwrap();
        let placed = membership.add_node(PeerNode::new("B", "10.0.0.2", 6380)).unwrap();
        membership.add_node(PeerNode::new("C", "10.0.0.3", 6381)).unwrap();

        assert_eq!(placed, Admission::SelfPlaced(1));
        let names: Vec<_> = membership.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(membership.self_index(), 1);
        assert_eq!(membership.iter().filter(|n| n.is_self).count(), 1);

        // A second listing of ourselves is a plain duplicate
        assert!(matches!(
            membership.add_node(PeerNode::new("B", "10.0.0.2", 6380)),
            Err(Error::DuplicateMember { .. })
        ));
    }

    #[test]
    fn test_second_local_node_rejected() {
        let mut membership = three_node_membership();
        let result = membership.add_node(PeerNode::local("X", "127.0.0.9", 7000));
        assert!(matches!(result, Err(Error::Config(_))));

        // Even with our own key
        let result = membership.add_node(PeerNode::local("A", "10.0.0.1", 6379));
        assert!(matches!(result, Err(Error::Config(_))));

        assert_eq!(membership.len(), 3);
        assert_eq!(membership.iter().filter(|n| n.is_self).count(), 1);
    }

    #[tokio::test]
    async fn test_update_reachability_attaches_link() {
        let mut membership = three_node_membership();
        let link = loopback_link("B").await;

        membership.update_reachability(1, link).unwrap();
        let node = membership.get(1).unwrap();
        assert_eq!(node.reachability, Reachability::Reachable);
        assert!(node.link.is_some());
        assert!(node.reachable_since.is_some());
        assert_eq!(membership.unreachable_count(), 1);

        // Self is never touched by a handshake
        let self_link = loopback_link("A").await;
        membership.update_reachability(0, self_link).unwrap();
        assert!(membership.get(0).unwrap().link.is_none());
    }

    #[tokio::test]
    async fn test_update_reachability_unknown_index() {
        let mut membership = three_node_membership();
        let link = loopback_link("Z").await;
        assert!(matches!(
            membership.update_reachability(9, link),
            Err(Error::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_slot_range() {
        let range = SlotRange { min: 34, max: 67 };
        assert_eq!(range.len(), 33);
        assert!(range.contains(34));
        assert!(range.contains(66));
        assert!(!range.contains(67));
        assert_eq!(range.to_string(), "[34, 67)");
    }
}
