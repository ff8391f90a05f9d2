//! Shibui - Cluster Formation for a Partitioned Key-Value Store
//!
//! Peer processes listed in a shared peers file find each other over a
//! dedicated bus port, wait until every peer is reachable, and then split
//! a fixed hash space into one contiguous range per node. No leader is
//! elected and no partition messages are exchanged: every node computes
//! the same table from the same ordered membership.
//!
//! # Architecture
//!
//! - [`cluster::Membership`] holds the ordered peers and their reachability
//! - [`network::Joiner`] / [`network::accept_join`] run the bus handshake
//! - [`cluster::FormationCoordinator`] probes until convergence
//! - [`cluster::balance`] assigns slot ranges once formation completes

pub mod config;
pub mod error;
pub mod cluster;
pub mod network;

pub use config::ShibuiConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ShibuiConfig;
    pub use crate::error::{Error, Result};
    pub use crate::cluster::{ClusterState, FormationCoordinator, FormationPhase, LocalIdentity, PartitionTable, PeerNode};
    pub use crate::network::{BusServer, Joiner, TcpDialer};
}
