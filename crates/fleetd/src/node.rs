//! The node context: everything the control loop owns.
//!
//! A [`Node`] is built once at startup and then moved onto the control
//! thread. Nothing else ever holds a reference to it: other threads reach
//! it only by queueing a [`Work`] item (see [`crate::handle::NodeHandle`]).

use std::sync::Arc;

use fleet_cluster::{NodeRegistry, ReplicatedStateStore};
use fleet_core::NodeConfig;
use fleet_core::protocol::{ClusterMessage, RpcResponse, ServiceRequest, ServiceUpdate, channels};
use fleet_core::types::{
    HostAndPort, NodeDescriptor, NodeId, NodeSnapshot, ServiceConfiguration, epoch_millis,
};
use fleet_placement::{compete_with_cluster, eligible_nodes, select_node};
use fleet_service::{Dispatch, ProcessLauncher, ServiceManager, ServiceSettings};
use fleet_state::{StateResult, StateStore};
use fleet_transport::{Packet, PacketSender};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::probe::ResourceProbe;

/// A unit of work run on the control thread.
pub type Work = Box<dyn FnOnce(&mut Node) + Send>;

pub struct Node {
    descriptor: NodeDescriptor,
    max_memory_mb: u64,
    registry: NodeRegistry,
    services: ServiceManager,
    state: ReplicatedStateStore,
    sender: Arc<dyn PacketSender>,
    probe: Box<dyn ResourceProbe>,
    rng: StdRng,
}

impl Node {
    /// Assemble the node and take its first snapshot.
    pub fn new(
        config: &NodeConfig,
        store: StateStore,
        sender: Arc<dyn PacketSender>,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Box<dyn ResourceProbe>,
    ) -> StateResult<Self> {
        let descriptor = config.local_descriptor();
        let registry = NodeRegistry::new(descriptor.clone(), config.cluster.nodes.clone());
        let services = ServiceManager::new(
            descriptor.clone(),
            ServiceSettings::from_config(config),
            launcher,
            sender.clone(),
        );
        let state = ReplicatedStateStore::open(store, sender.clone())?;

        let mut node = Self {
            descriptor,
            max_memory_mb: config.max_memory_mb,
            registry,
            services,
            state,
            sender,
            probe,
            rng: StdRng::from_entropy(),
        };
        let snapshot = node.build_snapshot();
        node.registry.roll_local_snapshot(snapshot);
        Ok(node)
    }

    pub fn local_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceManager {
        &mut self.services
    }

    pub fn state(&self) -> &ReplicatedStateStore {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ReplicatedStateStore {
        &mut self.state
    }

    // ── Snapshots ──────────────────────────────────────────────────

    pub fn build_snapshot(&mut self) -> NodeSnapshot {
        NodeSnapshot {
            timestamp_ms: epoch_millis(),
            node: self.descriptor.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            service_count: self.services.local_count() as u32,
            used_memory_mb: self.services.used_memory_mb(),
            reserved_memory_mb: self.services.reserved_memory_mb(),
            max_memory_mb: self.max_memory_mb,
            process: self.probe.sample(),
        }
    }

    /// Take a new local snapshot, make it current and send it to every
    /// peer.
    pub fn publish_snapshot(&mut self) -> NodeSnapshot {
        let snapshot = self.build_snapshot();
        self.registry.roll_local_snapshot(snapshot.clone());
        self.send_cluster_message(
            None,
            &ClusterMessage::NodeSnapshot {
                snapshot: snapshot.clone(),
            },
        );
        snapshot
    }

    fn send_cluster_message(&self, to: Option<&str>, message: &ClusterMessage) {
        let packet = match Packet::json(channels::CLUSTER, message) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "failed to encode cluster message");
                return;
            }
        };
        match to {
            Some(node_id) => {
                if !self.sender.send_to(node_id, packet) {
                    debug!(%node_id, "peer went away before cluster message was sent");
                }
            }
            None => self.sender.broadcast_peers(packet),
        }
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// Create and start one instance of every task that is below its
    /// minimum, unless a peer is better placed to host it. Returns how
    /// many instances were started.
    pub fn autoscale(&mut self) -> usize {
        let Some(local) = self.registry.local_snapshot().cloned() else {
            return 0;
        };
        let groups = self.state.groups();
        let mut started = 0;

        for task in self.state.tasks() {
            if task.maintenance || !task.admits(&self.descriptor.id) {
                continue;
            }
            let count = self.services.task_count(&task.name);
            if count >= task.min_service_count as usize {
                continue;
            }
            if !compete_with_cluster(&task, &local, &self.registry.candidates()) {
                continue;
            }

            debug!(task = %task.name, count, min = task.min_service_count, "task below minimum");
            let Some(created) = self.services.create(task.to_configuration(&groups)) else {
                continue;
            };
            if self.services.start(created.unique_id()).is_some() {
                started += 1;
            }
        }

        if started > 0 {
            info!(started, "auto-scaled tasks");
        }
        started
    }

    /// Route a service operation: run it here or hand it back for the
    /// owning peer.
    pub fn dispatch_service(&mut self, request: ServiceRequest) -> Dispatch<RpcResponse> {
        let registry = &self.registry;
        self.services
            .dispatch(request, |node_id| registry.is_connected(node_id))
    }

    pub fn dispatch_create(&mut self, configuration: ServiceConfiguration) -> Dispatch<RpcResponse> {
        let registry = &self.registry;
        self.services
            .dispatch_create(configuration, |node_id| registry.is_connected(node_id))
    }

    /// Place a new instance of `task_name` on the best node for it.
    pub fn dispatch_task_placement(&mut self, task_name: &str) -> Dispatch<RpcResponse> {
        let Some(task) = self.state.task(task_name).cloned() else {
            debug!(task = %task_name, "placement requested for unknown task");
            return Dispatch::Handled(None);
        };
        let Some(local) = self.registry.local_snapshot().cloned() else {
            return Dispatch::Handled(None);
        };

        let candidates = self.registry.candidates();
        let target = if task.admits(&self.descriptor.id) {
            select_node(&task, &local, &candidates).node_id().to_string()
        } else {
            match eligible_nodes(&task, &self.descriptor.id, &candidates).first() {
                Some(node_id) => node_id.to_string(),
                None => {
                    debug!(task = %task_name, "no eligible node for task");
                    return Dispatch::Handled(None);
                }
            }
        };

        let mut configuration = task.to_configuration(&self.state.groups());
        configuration.node_id = Some(target);
        self.dispatch_create(configuration)
    }

    /// One random listener per disconnected peer.
    pub fn connect_targets(&mut self) -> Vec<(NodeId, HostAndPort)> {
        self.registry.connect_targets(&mut self.rng)
    }

    // ── Inbound events ─────────────────────────────────────────────

    /// Mark the peer connected and push it everything it needs to catch
    /// up: our snapshot, the replicated state and our workers.
    pub fn on_peer_connected(&mut self, node_id: &str) {
        if !self.registry.mark_connected(node_id) {
            return;
        }
        if let Some(snapshot) = self.registry.local_snapshot().cloned() {
            self.send_cluster_message(Some(node_id), &ClusterMessage::NodeSnapshot { snapshot });
        }
        for message in self.state.full_state() {
            self.send_cluster_message(Some(node_id), &message);
        }
        self.send_cluster_message(
            Some(node_id),
            &ClusterMessage::SetGlobalServices {
                services: self.services.local_snapshots(),
            },
        );
    }

    pub fn on_peer_disconnected(&mut self, node_id: &str) {
        if self.registry.mark_disconnected(node_id) {
            self.services.forget_node(node_id);
        }
    }

    pub fn on_service_connected(&mut self, unique_id: &Uuid, connected: bool) {
        if !self.services.set_connected(unique_id, connected) {
            debug!(id = %unique_id, connected, "connection change for unknown service");
        }
    }

    /// Apply a cluster broadcast received from `from`.
    pub fn handle_cluster_message(&mut self, from: &str, message: ClusterMessage) {
        match message {
            ClusterMessage::NodeSnapshot { snapshot } => {
                if snapshot.node_id() != from {
                    warn!(%from, claimed = %snapshot.node_id(), "peer sent a snapshot for another node");
                    return;
                }
                self.registry.update_snapshot(snapshot);
            }
            ClusterMessage::SetGlobalServices { services } => {
                let applied = self.services.replace_remote(from, services);
                debug!(%from, applied, "peer services replaced");
            }
            message => {
                if let Err(e) = self.state.apply(message) {
                    warn!(%from, error = %e, "failed to apply replicated state");
                }
            }
        }
    }

    pub fn handle_service_update(&mut self, from: &str, update: ServiceUpdate) {
        if update.snapshot.owner() != from {
            debug!(%from, owner = %update.snapshot.owner(), "relayed service update ignored");
            return;
        }
        self.services.apply_remote(update.snapshot);
    }

    /// Delete every local worker before the node goes away.
    pub fn shutdown(&mut self) {
        let deleted = self.services.delete_all();
        info!(deleted, "local services deleted");
    }
}
