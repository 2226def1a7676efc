//! fleet-core — shared vocabulary of the Fleet orchestrator.
//!
//! Holds the data model exchanged between manager nodes (node and service
//! snapshots, service tasks, group configurations), the TOML node
//! configuration, and the typed messages carried on each cluster channel.

pub mod config;
pub mod protocol;
pub mod types;

pub use config::{ConfigError, NodeConfig};
pub use types::*;
