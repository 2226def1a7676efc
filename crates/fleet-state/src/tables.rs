//! redb table definitions for the Fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Service tasks keyed by task name.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Group configurations keyed by group name.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// The permission snapshot under the single key [`PERMISSIONS_KEY`].
pub const PERMISSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("permissions");

/// Dataset documents keyed by `{dataset}/{key}`.
pub const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

pub const PERMISSIONS_KEY: &str = "current";
