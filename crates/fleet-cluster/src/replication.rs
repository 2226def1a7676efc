//! Replicated cluster state — tasks, groups, permissions and datasets.
//!
//! Every node holds a full copy. A local change is persisted, then the
//! complete collection is broadcast on the cluster channel; an inbound
//! broadcast replaces the local copy wholesale. There is no versioning:
//! the last write to arrive wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_core::protocol::{ClusterMessage, channels};
use fleet_core::types::{
    Datasets, GroupConfiguration, PermissionSnapshot, ServiceTask, is_valid_name,
};
use fleet_state::{StateResult, StateStore};
use fleet_transport::{Packet, PacketSender};
use tracing::{debug, info, warn};

pub struct ReplicatedStateStore {
    store: StateStore,
    sender: Arc<dyn PacketSender>,
    tasks: BTreeMap<String, ServiceTask>,
    groups: BTreeMap<String, GroupConfiguration>,
    permissions: PermissionSnapshot,
    datasets: Datasets,
}

impl ReplicatedStateStore {
    /// Load the persisted state.
    pub fn open(store: StateStore, sender: Arc<dyn PacketSender>) -> StateResult<Self> {
        let tasks = store
            .list_tasks()?
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        let groups = store
            .list_groups()?
            .into_iter()
            .map(|g| (g.name.clone(), g))
            .collect();
        let permissions = store.get_permissions()?;
        let datasets = store.datasets()?;

        let replicated = Self {
            store,
            sender,
            tasks,
            groups,
            permissions,
            datasets,
        };
        info!(
            tasks = replicated.tasks.len(),
            groups = replicated.groups.len(),
            datasets = replicated.datasets.len(),
            "replicated state loaded"
        );
        Ok(replicated)
    }

    fn publish(&self, message: &ClusterMessage) {
        match Packet::json(channels::CLUSTER, message) {
            Ok(packet) => self.sender.broadcast(packet),
            Err(e) => warn!(error = %e, "failed to encode cluster message"),
        }
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn tasks(&self) -> Vec<ServiceTask> {
        self.tasks.values().cloned().collect()
    }

    pub fn task(&self, name: &str) -> Option<&ServiceTask> {
        self.tasks.get(name)
    }

    /// Insert or replace a task. Returns false for an invalid task.
    pub fn add_task(&mut self, task: ServiceTask) -> StateResult<bool> {
        if !is_valid_name(&task.name) {
            warn!(task = %task.name, "rejected task with invalid name");
            return Ok(false);
        }
        self.store.put_task(&task)?;
        info!(task = %task.name, min = task.min_service_count, "task stored");
        self.tasks.insert(task.name.clone(), task);
        self.publish(&ClusterMessage::SetTasks {
            tasks: self.tasks(),
        });
        Ok(true)
    }

    pub fn remove_task(&mut self, name: &str) -> StateResult<bool> {
        if !self.tasks.contains_key(name) {
            return Ok(false);
        }
        self.store.delete_task(name)?;
        self.tasks.remove(name);
        info!(task = %name, "task removed");
        self.publish(&ClusterMessage::SetTasks {
            tasks: self.tasks(),
        });
        Ok(true)
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn groups(&self) -> Vec<GroupConfiguration> {
        self.groups.values().cloned().collect()
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfiguration> {
        self.groups.get(name)
    }

    pub fn add_group(&mut self, group: GroupConfiguration) -> StateResult<bool> {
        if !is_valid_name(&group.name) {
            warn!(group = %group.name, "rejected group with invalid name");
            return Ok(false);
        }
        self.store.put_group(&group)?;
        info!(group = %group.name, "group stored");
        self.groups.insert(group.name.clone(), group);
        self.publish(&ClusterMessage::SetGroups {
            groups: self.groups(),
        });
        Ok(true)
    }

    pub fn remove_group(&mut self, name: &str) -> StateResult<bool> {
        if !self.groups.contains_key(name) {
            return Ok(false);
        }
        self.store.delete_group(name)?;
        self.groups.remove(name);
        info!(group = %name, "group removed");
        self.publish(&ClusterMessage::SetGroups {
            groups: self.groups(),
        });
        Ok(true)
    }

    // ── Permissions ────────────────────────────────────────────────

    pub fn permissions(&self) -> &PermissionSnapshot {
        &self.permissions
    }

    pub fn set_permissions(&mut self, permissions: PermissionSnapshot) -> StateResult<()> {
        self.store.put_permissions(&permissions)?;
        self.permissions = permissions;
        self.publish(&ClusterMessage::SetPermissions {
            permissions: self.permissions.clone(),
        });
        Ok(())
    }

    // ── Datasets ───────────────────────────────────────────────────

    pub fn datasets(&self) -> &Datasets {
        &self.datasets
    }

    pub fn document(&self, dataset: &str, key: &str) -> Option<&serde_json::Value> {
        self.datasets.get(dataset).and_then(|d| d.get(key))
    }

    pub fn put_document(
        &mut self,
        dataset: &str,
        key: &str,
        document: serde_json::Value,
    ) -> StateResult<()> {
        self.store.put_document(dataset, key, &document)?;
        self.datasets
            .entry(dataset.to_string())
            .or_default()
            .insert(key.to_string(), document);
        debug!(%dataset, %key, "document stored");
        self.publish(&ClusterMessage::SetDatasets {
            datasets: self.datasets.clone(),
        });
        Ok(())
    }

    pub fn remove_document(&mut self, dataset: &str, key: &str) -> StateResult<bool> {
        if self.document(dataset, key).is_none() {
            return Ok(false);
        }
        self.store.delete_document(dataset, key)?;
        if let Some(documents) = self.datasets.get_mut(dataset) {
            documents.remove(key);
            if documents.is_empty() {
                self.datasets.remove(dataset);
            }
        }
        debug!(%dataset, %key, "document removed");
        self.publish(&ClusterMessage::SetDatasets {
            datasets: self.datasets.clone(),
        });
        Ok(true)
    }

    // ── Replication ────────────────────────────────────────────────

    /// Apply a state broadcast from a peer as a full overwrite.
    ///
    /// Returns false for messages that carry no replicated state. Applied
    /// state is never re-broadcast.
    pub fn apply(&mut self, message: ClusterMessage) -> StateResult<bool> {
        match message {
            ClusterMessage::SetTasks { tasks } => {
                self.store.replace_tasks(&tasks)?;
                debug!(count = tasks.len(), "tasks replaced from peer");
                self.tasks = tasks.into_iter().map(|t| (t.name.clone(), t)).collect();
            }
            ClusterMessage::SetGroups { groups } => {
                self.store.replace_groups(&groups)?;
                debug!(count = groups.len(), "groups replaced from peer");
                self.groups = groups.into_iter().map(|g| (g.name.clone(), g)).collect();
            }
            ClusterMessage::SetPermissions { permissions } => {
                self.store.put_permissions(&permissions)?;
                debug!("permissions replaced from peer");
                self.permissions = permissions;
            }
            ClusterMessage::SetDatasets { datasets } => {
                self.store.replace_datasets(&datasets)?;
                debug!(count = datasets.len(), "datasets replaced from peer");
                self.datasets = datasets;
            }
            ClusterMessage::NodeSnapshot { .. } | ClusterMessage::SetGlobalServices { .. } => {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The complete replicated state, as pushed to a newly connected peer.
    pub fn full_state(&self) -> Vec<ClusterMessage> {
        vec![
            ClusterMessage::SetTasks {
                tasks: self.tasks(),
            },
            ClusterMessage::SetGroups {
                groups: self.groups(),
            },
            ClusterMessage::SetPermissions {
                permissions: self.permissions.clone(),
            },
            ClusterMessage::SetDatasets {
                datasets: self.datasets.clone(),
            },
        ]
    }
}
