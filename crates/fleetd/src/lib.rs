//! fleetd — the Fleet manager node.
//!
//! Assembles the subsystems of one node around a single-writer control
//! loop:
//!
//! ```text
//!   transport tasks ──┐                       ┌── NodeRegistry
//!   api callers ──────┼─► work queue ─► Node ─┼── ServiceManager
//!   event pump ───────┘   (mpsc)      (fleet- └── ReplicatedStateStore
//!                                     control)
//! ```
//!
//! - [`node`]: the `Node` context the control loop owns exclusively.
//! - [`control_loop`]: the ticking loop (drain, auto-scale, sweep,
//!   snapshot, flush).
//! - [`handle`]: `NodeHandle`, the cloneable way in from other threads.
//! - [`api`]: capability traits for collaborators.
//! - [`handlers`]: inbound channel handlers and the transport event pump.
//! - [`probe`]: process resource sampling for node snapshots.
//! - [`daemon`]: start-up and shutdown.

pub mod api;
pub mod control_loop;
pub mod daemon;
pub mod handle;
pub mod handlers;
pub mod node;
pub mod probe;

pub use api::{ClusterMessaging, NodeOperations, ServiceOperations};
pub use control_loop::ControlLoop;
pub use handle::NodeHandle;
pub use node::{Node, Work};
pub use probe::{FixedProbe, ResourceProbe, SysinfoProbe};
