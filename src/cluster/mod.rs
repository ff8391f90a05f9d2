//! Cluster Formation Module
//!
//! Membership tracking, the formation coordinator and the range balancer.

mod membership;
mod state;
pub mod peers;
pub mod balancer;
pub mod coordinator;

pub use membership::{Admission, Membership, PeerInfo, PeerNode, Reachability, SlotRange, BUS_PORT_OFFSET};
pub use state::{ClusterState, InboundMatch, LocalIdentity};
pub use balancer::{balance, PartitionEntry, PartitionTable};
pub use coordinator::{FormationConfig, FormationCoordinator, FormationHandle, FormationPhase, FormationReport};
