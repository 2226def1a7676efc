//! fleet-state — embedded state store for Fleet.
//!
//! Backed by [redb](https://docs.rs/redb), persists the replicated cluster
//! state a node must survive a restart with: service tasks, group
//! configurations, the permission snapshot and key-value datasets.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! Dataset documents use composite `{dataset}/{key}` keys so a dataset is
//! a prefix scan. The `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
