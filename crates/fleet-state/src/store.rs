//! StateStore — redb-backed persistence of replicated cluster state.
//!
//! Tasks and groups are keyed by name; the permission snapshot lives under
//! one fixed key; dataset documents use `{dataset}/{key}`. Replication
//! applies inbound state as full overwrites, so every collection also has a
//! `replace_*` operation that swaps the whole table in one transaction.

use std::path::Path;
use std::sync::Arc;

use fleet_core::types::{Datasets, GroupConfiguration, PermissionSnapshot, ServiceTask};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(PERMISSIONS).map_err(map_err!(Table))?;
        txn.open_table(DOCUMENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_json<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &str,
    ) -> StateResult<Vec<(String, T)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let parsed: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push((key.value().to_string(), parsed));
            }
        }
        Ok(results)
    }

    fn delete_key(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Clear `table` and insert `entries` in a single write transaction.
    fn replace_all<T: Serialize>(
        &self,
        table: Table,
        entries: impl IntoIterator<Item = (String, T)>,
    ) -> StateResult<u32> {
        let mut encoded = Vec::new();
        for (key, value) in entries {
            let value = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
            encoded.push((key, value));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let existing: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| entry.ok().map(|(key, _)| key.value().to_string()))
                .collect();
            for key in &existing {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for (key, value) in &encoded {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(encoded.len() as u32)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a service task.
    pub fn put_task(&self, task: &ServiceTask) -> StateResult<()> {
        self.put_json(TASKS, &task.name, task)?;
        debug!(task = %task.name, "task stored");
        Ok(())
    }

    pub fn get_task(&self, name: &str) -> StateResult<Option<ServiceTask>> {
        self.get_json(TASKS, name)
    }

    /// List all tasks, ordered by name.
    pub fn list_tasks(&self) -> StateResult<Vec<ServiceTask>> {
        Ok(self
            .scan_json(TASKS, "")?
            .into_iter()
            .map(|(_, task)| task)
            .collect())
    }

    /// Delete a task by name. Returns true if it existed.
    pub fn delete_task(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete_key(TASKS, name)?;
        debug!(task = %name, existed, "task deleted");
        Ok(existed)
    }

    /// Replace the whole task table.
    pub fn replace_tasks(&self, tasks: &[ServiceTask]) -> StateResult<()> {
        let count = self.replace_all(TASKS, tasks.iter().map(|t| (t.name.clone(), t)))?;
        debug!(count, "task table replaced");
        Ok(())
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn put_group(&self, group: &GroupConfiguration) -> StateResult<()> {
        self.put_json(GROUPS, &group.name, group)?;
        debug!(group = %group.name, "group stored");
        Ok(())
    }

    pub fn get_group(&self, name: &str) -> StateResult<Option<GroupConfiguration>> {
        self.get_json(GROUPS, name)
    }

    pub fn list_groups(&self) -> StateResult<Vec<GroupConfiguration>> {
        Ok(self
            .scan_json(GROUPS, "")?
            .into_iter()
            .map(|(_, group)| group)
            .collect())
    }

    pub fn delete_group(&self, name: &str) -> StateResult<bool> {
        self.delete_key(GROUPS, name)
    }

    pub fn replace_groups(&self, groups: &[GroupConfiguration]) -> StateResult<()> {
        let count = self.replace_all(GROUPS, groups.iter().map(|g| (g.name.clone(), g)))?;
        debug!(count, "group table replaced");
        Ok(())
    }

    // ── Permissions ────────────────────────────────────────────────

    pub fn put_permissions(&self, permissions: &PermissionSnapshot) -> StateResult<()> {
        self.put_json(PERMISSIONS, PERMISSIONS_KEY, permissions)
    }

    /// The stored permission snapshot, or an empty one.
    pub fn get_permissions(&self) -> StateResult<PermissionSnapshot> {
        Ok(self
            .get_json(PERMISSIONS, PERMISSIONS_KEY)?
            .unwrap_or_default())
    }

    // ── Datasets ───────────────────────────────────────────────────

    fn document_key(dataset: &str, key: &str) -> StateResult<String> {
        if dataset.is_empty() || dataset.contains('/') {
            return Err(StateError::InvalidKey(format!("dataset name '{dataset}'")));
        }
        if key.is_empty() {
            return Err(StateError::InvalidKey(format!("empty key in '{dataset}'")));
        }
        Ok(format!("{dataset}/{key}"))
    }

    /// Insert or update a document in a dataset.
    pub fn put_document(
        &self,
        dataset: &str,
        key: &str,
        document: &serde_json::Value,
    ) -> StateResult<()> {
        let composite = Self::document_key(dataset, key)?;
        self.put_json(DOCUMENTS, &composite, document)
    }

    pub fn get_document(&self, dataset: &str, key: &str) -> StateResult<Option<serde_json::Value>> {
        let composite = Self::document_key(dataset, key)?;
        self.get_json(DOCUMENTS, &composite)
    }

    pub fn delete_document(&self, dataset: &str, key: &str) -> StateResult<bool> {
        let composite = Self::document_key(dataset, key)?;
        self.delete_key(DOCUMENTS, &composite)
    }

    /// Every dataset with all of its documents.
    pub fn datasets(&self) -> StateResult<Datasets> {
        let mut datasets = Datasets::new();
        for (composite, document) in self.scan_json::<serde_json::Value>(DOCUMENTS, "")? {
            if let Some((dataset, key)) = composite.split_once('/') {
                datasets
                    .entry(dataset.to_string())
                    .or_default()
                    .insert(key.to_string(), document);
            }
        }
        Ok(datasets)
    }

    pub fn replace_datasets(&self, datasets: &Datasets) -> StateResult<()> {
        let mut entries = Vec::new();
        for (dataset, documents) in datasets {
            for (key, document) in documents {
                entries.push((Self::document_key(dataset, key)?, document));
            }
        }
        let count = self.replace_all(DOCUMENTS, entries)?;
        debug!(count, "dataset documents replaced");
        Ok(())
    }
}
