//! fleet-cluster — the local node's view of the cluster.
//!
//! - [`NodeRegistry`]: configured peers, their connection state and latest
//!   snapshots, plus the local node's current and previous snapshot.
//! - [`ReplicatedStateStore`]: tasks, groups, permission data and datasets
//!   owned by this node, broadcast on every change and overwritten
//!   wholesale by inbound broadcasts.
//!
//! Both are plain single-owner structs; the control loop holds them and
//! mutates them from one thread.

pub mod registry;
pub mod replication;

pub use registry::{NodeRegistry, Peer, PeerStatus};
pub use replication::ReplicatedStateStore;
