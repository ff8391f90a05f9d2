//! Shared Cluster State
//!
//! Membership, the formation flag and the partition table form one unit
//! of mutable state, shared by the bus server and the formation
//! coordinator. Every access goes through the same lock and no network
//! I/O happens while it is held.

use tokio::sync::{RwLock, RwLockWriteGuard};

use super::balancer::{balance, PartitionTable};
use super::membership::{Admission, Membership, PeerInfo, PeerNode};
use crate::error::Result;
use crate::network::PeerLink;

/// Identity of the local node, as announced in handshakes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: String,
    pub address: String,
    pub client_port: u16,
}

impl LocalIdentity {
    pub fn new(name: impl Into<String>, address: impl Into<String>, client_port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            client_port,
        }
    }
}

/// Everything guarded by the state lock
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) membership: Membership,
    pub(crate) formation_pending: bool,
    pub(crate) partition: Option<PartitionTable>,
    pub(crate) balance_count: u32,
}

impl Inner {
    /// Run the balancer over the current membership and record the result
    pub(crate) fn rebalance(&mut self, hash_span: u64) -> Result<PartitionTable> {
        let table = balance(&mut self.membership, hash_span)?;
        self.partition = Some(table.clone());
        self.balance_count += 1;
        Ok(table)
    }
}

/// How an inbound hello was matched against the membership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMatch {
    /// A configured member became reachable
    Known(usize),
    /// An unknown peer was appended
    Added(usize),
}

/// Process-wide cluster state
pub struct ClusterState {
    local: LocalIdentity,
    inner: RwLock<Inner>,
}

impl ClusterState {
    /// Create state for a node that will form a cluster
    pub fn new(local: LocalIdentity) -> Self {
        Self::with_formation(local, true)
    }

    /// Create state for a standalone node (nothing to form)
    pub fn single_node(local: LocalIdentity) -> Self {
        Self::with_formation(local, false)
    }

    fn with_formation(local: LocalIdentity, formation_pending: bool) -> Self {
        let self_node = PeerNode::local(local.name.clone(), local.address.clone(), local.client_port);
        Self {
            local,
            inner: RwLock::new(Inner {
                membership: Membership::new(self_node),
                formation_pending,
                partition: None,
                balance_count: 0,
            }),
        }
    }

    /// Local node identity
    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    /// Add a node to the membership
    pub async fn add_node(&self, node: PeerNode) -> Result<Admission> {
        self.inner.write().await.membership.add_node(node)
    }

    /// Record a successful outbound join, locating the member by key
    pub async fn mark_reachable(&self, address: &str, client_port: u16, link: PeerLink) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let index = inner.membership.position(address, client_port).ok_or_else(|| {
            crate::Error::NodeNotFound(format!("{}:{}", address, client_port))
        })?;
        inner.membership.update_reachability(index, link)?;
        Ok(index)
    }

    /// Match an inbound hello: mark a known member reachable or append a new one
    pub async fn accept_inbound(&self, name: &str, address: &str, client_port: u16, link: PeerLink) -> Result<InboundMatch> {
        let mut inner = self.inner.write().await;
        if let Some(index) = inner.membership.position(address, client_port) {
            inner.membership.update_reachability(index, link)?;
            return Ok(InboundMatch::Known(index));
        }

        match inner.membership.add_node(PeerNode::new(name, address, client_port))? {
            Admission::Added(index) => {
                inner.membership.update_reachability(index, link)?;
                Ok(InboundMatch::Added(index))
            }
            // Unreachable: `position` found no entry with this key, self included
            Admission::SelfPlaced(index) => Ok(InboundMatch::Known(index)),
        }
    }

    /// Number of members without a bus link
    pub async fn unreachable_count(&self) -> usize {
        self.inner.read().await.membership.unreachable_count()
    }

    /// Whether the cluster is still forming
    pub async fn formation_pending(&self) -> bool {
        self.inner.read().await.formation_pending
    }

    /// Snapshot of every member in order
    pub async fn members(&self) -> Vec<PeerInfo> {
        self.inner.read().await.membership.snapshot()
    }

    /// Members the coordinator still has to probe
    pub async fn unreachable_members(&self) -> Vec<PeerInfo> {
        let inner = self.inner.read().await;
        inner
            .membership
            .iter()
            .filter(|n| !Membership::is_reachable(n))
            .map(PeerNode::info)
            .collect()
    }

    /// Last computed partition table
    pub async fn partition(&self) -> Option<PartitionTable> {
        self.inner.read().await.partition.clone()
    }

    /// How many times the balancer has run
    pub async fn balance_count(&self) -> u32 {
        self.inner.read().await.balance_count
    }

    pub async fn size(&self) -> usize {
        self.inner.read().await.membership.len()
    }

    /// Exclusive access for multi-step transitions (convergence + balance)
    pub(crate) async fn lock(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::Reachability;
    use crate::network::test_support::loopback_link;

    fn local() -> LocalIdentity {
        LocalIdentity::new("A", "127.0.0.1", 6379)
    }

    #[tokio::test]
    async fn test_new_state() {
        let state = ClusterState::new(local());
        assert!(state.formation_pending().await);
        assert_eq!(state.size().await, 1);
        assert_eq!(state.unreachable_count().await, 0);
        assert!(state.partition().await.is_none());

        let single = ClusterState::single_node(local());
        assert!(!single.formation_pending().await);
    }

    #[tokio::test]
    async fn test_accept_inbound_known_and_unknown() {
        let state = ClusterState::new(local());
        state.add_node(PeerNode::new("B", "127.0.0.2", 6380)).await.unwrap();
        assert_eq!(state.unreachable_count().await, 1);

        let matched = state
            .accept_inbound("B", "127.0.0.2", 6380, loopback_link("B").await)
            .await
            .unwrap();
        assert_eq!(matched, InboundMatch::Known(1));
        assert_eq!(state.unreachable_count().await, 0);

        let added = state
            .accept_inbound("D", "127.0.0.4", 6382, loopback_link("D").await)
            .await
            .unwrap();
        assert_eq!(added, InboundMatch::Added(2));

        let members = state.members().await;
        assert_eq!(members.len(), 3);
        assert_eq!(members[2].name, "D");
        assert_eq!(members[2].reachability, Reachability::Reachable);
        assert!(members[2].linked);
    }

    #[tokio::test]
    async fn test_mark_reachable_unknown_member() {
        let state = ClusterState::new(local());
        let result = state.mark_reachable("127.0.0.9", 7000, loopback_link("Z").await).await;
        assert!(result.is_err());
        assert_eq!(state.size().await, 1);
    }

    #[tokio::test]
    async fn test_rebalance_records_table() {
        let state = ClusterState::new(local());
        state.add_node(PeerNode::new("B", "127.0.0.2", 6380)).await.unwrap();

        let table = state.lock().await.rebalance(100).unwrap();
        assert_eq!(table.entries().len(), 2);
        assert_eq!(state.balance_count().await, 1);
        assert_eq!(state.partition().await, Some(table));
    }
}
