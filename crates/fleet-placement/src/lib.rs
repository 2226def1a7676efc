//! fleet-placement — decides which node should host a new worker.
//!
//! Pure decision logic over node snapshots. Every node evaluates the same
//! rule independently on its own view of the cluster:
//!
//! - **headroom** = `max_memory_mb - reserved_memory_mb` (higher is better)
//! - **load** = `cpu_usage × service_count` (lower is better)
//!
//! A node only beats another when it is strictly better on *both* axes.
//! With no coordination, two nodes may both decide to place; the extra
//! instance is tolerated and later ticks see it in the global count.

pub mod placer;

pub use placer::{Candidate, beats, compete_with_cluster, eligible_nodes, select_node};
