//! Capability traits offered to collaborators, implemented by
//! [`NodeHandle`].
//!
//! Every method resolves once the control loop has run the request, or
//! once the owning peer answered a forwarded one. Results are copies.

use std::future::Future;
use std::pin::Pin;

use fleet_core::protocol::{ChannelMessage, RpcResponse, ServiceOperation, ServiceRequest, channels};
use fleet_core::types::{
    GroupConfiguration, NodeSnapshot, PermissionSnapshot, ServiceConfiguration, ServiceDeployment,
    ServiceLifeCycle, ServiceRemoteInclusion, ServiceSnapshot, ServiceTask, ServiceTemplate,
};
use fleet_service::lifecycle_operation;
use fleet_transport::{Packet, PacketHandler};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handle::NodeHandle;

/// Boxed future returned by every API method.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Filter applied to the global service table.
pub type ServiceFilter = Box<dyn Fn(&ServiceSnapshot) -> bool + Send>;

pub trait ServiceOperations: Send + Sync {
    /// Create a worker on the node the configuration names, or locally
    /// when it names none.
    fn create_service(&self, configuration: ServiceConfiguration) -> ApiFuture<'_, Option<ServiceSnapshot>>;

    /// Create one instance of a task on the node placement selects.
    fn create_service_for_task<'a>(&'a self, task_name: &'a str) -> ApiFuture<'a, Option<ServiceSnapshot>>;

    fn service_snapshot(&self, unique_id: Uuid) -> ApiFuture<'_, Option<ServiceSnapshot>>;

    fn list_services(&self, filter: ServiceFilter) -> ApiFuture<'_, Vec<ServiceSnapshot>>;

    fn set_lifecycle(
        &self,
        unique_id: Uuid,
        target: ServiceLifeCycle,
    ) -> ApiFuture<'_, Option<ServiceSnapshot>>;

    fn send_command<'a>(&'a self, unique_id: Uuid, command: &'a str) -> ApiFuture<'a, Option<ServiceSnapshot>>;

    fn cached_logs(&self, unique_id: Uuid) -> ApiFuture<'_, Option<Vec<String>>>;

    fn restart(&self, unique_id: Uuid) -> ApiFuture<'_, Option<ServiceSnapshot>>;

    fn kill(&self, unique_id: Uuid) -> ApiFuture<'_, Option<ServiceSnapshot>>;

    fn queue_template(
        &self,
        unique_id: Uuid,
        template: ServiceTemplate,
    ) -> ApiFuture<'_, Option<ServiceSnapshot>>;

    fn queue_inclusion(
        &self,
        unique_id: Uuid,
        inclusion: ServiceRemoteInclusion,
    ) -> ApiFuture<'_, Option<ServiceSnapshot>>;

    fn add_deployment(
        &self,
        unique_id: Uuid,
        deployment: ServiceDeployment,
    ) -> ApiFuture<'_, Option<ServiceSnapshot>>;
}

pub trait NodeOperations: Send + Sync {
    /// Local snapshot first, then every peer snapshot received.
    fn list_node_snapshots(&self) -> ApiFuture<'_, Vec<NodeSnapshot>>;

    fn node_snapshot<'a>(&'a self, node_id: &'a str) -> ApiFuture<'a, Option<NodeSnapshot>>;

    fn local_snapshot(&self) -> ApiFuture<'_, Option<NodeSnapshot>>;

    fn tasks(&self) -> ApiFuture<'_, Vec<ServiceTask>>;

    /// Returns false for an invalid task or a storage failure.
    fn add_task(&self, task: ServiceTask) -> ApiFuture<'_, bool>;

    fn remove_task<'a>(&'a self, name: &'a str) -> ApiFuture<'a, bool>;

    fn groups(&self) -> ApiFuture<'_, Vec<GroupConfiguration>>;

    fn add_group(&self, group: GroupConfiguration) -> ApiFuture<'_, bool>;

    fn remove_group<'a>(&'a self, name: &'a str) -> ApiFuture<'a, bool>;

    fn set_permissions(&self, permissions: PermissionSnapshot) -> ApiFuture<'_, bool>;

    fn put_document<'a>(
        &'a self,
        dataset: &'a str,
        key: &'a str,
        document: serde_json::Value,
    ) -> ApiFuture<'a, bool>;

    fn remove_document<'a>(&'a self, dataset: &'a str, key: &'a str) -> ApiFuture<'a, bool>;
}

pub trait ClusterMessaging: Send + Sync {
    fn register_channel_handler(&self, channel: &str, handler: PacketHandler);

    /// Send to every peer and every connected worker.
    fn broadcast(&self, packet: Packet);

    /// Wrap `message` in a [`ChannelMessage`] and broadcast it. Returns
    /// false if it could not be encoded.
    fn send_channel_message(&self, channel: &str, message: &str, data: serde_json::Value) -> bool;
}

impl NodeHandle {
    async fn service_call(&self, unique_id: Uuid, operation: ServiceOperation) -> Option<ServiceSnapshot> {
        let request = ServiceRequest {
            service_id: unique_id,
            operation,
        };
        let dispatch = self.call(move |node| node.dispatch_service(request)).await;
        match self.resolve(dispatch).await? {
            RpcResponse::Snapshot { snapshot } => snapshot,
            other => {
                debug!(id = %unique_id, ?other, "unexpected response to service operation");
                None
            }
        }
    }

    async fn state_call<F>(&self, what: &'static str, work: F) -> bool
    where
        F: FnOnce(&mut crate::node::Node) -> fleet_state::StateResult<bool> + Send + 'static,
    {
        match self.call(work).await {
            Some(Ok(changed)) => changed,
            Some(Err(e)) => {
                warn!(error = %e, "failed to {what}");
                false
            }
            None => false,
        }
    }
}

fn snapshot_of(response: Option<RpcResponse>) -> Option<ServiceSnapshot> {
    match response? {
        RpcResponse::Snapshot { snapshot } => snapshot,
        _ => None,
    }
}

impl ServiceOperations for NodeHandle {
    fn create_service(&self, configuration: ServiceConfiguration) -> ApiFuture<'_, Option<ServiceSnapshot>> {
        Box::pin(async move {
            let dispatch = self.call(move |node| node.dispatch_create(configuration)).await;
            snapshot_of(self.resolve(dispatch).await)
        })
    }

    fn create_service_for_task<'a>(&'a self, task_name: &'a str) -> ApiFuture<'a, Option<ServiceSnapshot>> {
        let task_name = task_name.to_string();
        Box::pin(async move {
            let dispatch = self
                .call(move |node| node.dispatch_task_placement(&task_name))
                .await;
            snapshot_of(self.resolve(dispatch).await)
        })
    }

    fn service_snapshot(&self, unique_id: Uuid) -> ApiFuture<'_, Option<ServiceSnapshot>> {
        Box::pin(async move {
            self.call(move |node| node.services().get(&unique_id))
                .await
                .flatten()
        })
    }

    fn list_services(&self, filter: ServiceFilter) -> ApiFuture<'_, Vec<ServiceSnapshot>> {
        Box::pin(async move {
            self.call(move |node| node.services().list(|s| filter(s)))
                .await
                .unwrap_or_default()
        })
    }

    fn set_lifecycle(
        &self,
        unique_id: Uuid,
        target: ServiceLifeCycle,
    ) -> ApiFuture<'_, Option<ServiceSnapshot>> {
        Box::pin(async move {
            let operation = lifecycle_operation(target)?;
            self.service_call(unique_id, operation).await
        })
    }

    fn send_command<'a>(&'a self, unique_id: Uuid, command: &'a str) -> ApiFuture<'a, Option<ServiceSnapshot>> {
        let command = command.to_string();
        Box::pin(async move {
            self.service_call(unique_id, ServiceOperation::RunCommand { command })
                .await
        })
    }

    fn cached_logs(&self, unique_id: Uuid) -> ApiFuture<'_, Option<Vec<String>>> {
        Box::pin(async move {
            let request = ServiceRequest {
                service_id: unique_id,
                operation: ServiceOperation::CachedLogs,
            };
            let dispatch = self.call(move |node| node.dispatch_service(request)).await;
            match self.resolve(dispatch).await? {
                RpcResponse::Logs { lines } => lines,
                _ => None,
            }
        })
    }

    fn restart(&self, unique_id: Uuid) -> ApiFuture<'_, Option<ServiceSnapshot>> {
        Box::pin(self.service_call(unique_id, ServiceOperation::Restart))
    }

    fn kill(&self, unique_id: Uuid) -> ApiFuture<'_, Option<ServiceSnapshot>> {
        Box::pin(self.service_call(unique_id, ServiceOperation::Kill))
    }

    fn queue_template(
        &self,
        unique_id: Uuid,
        template: ServiceTemplate,
    ) -> ApiFuture<'_, Option<ServiceSnapshot>> {
        Box::pin(self.service_call(unique_id, ServiceOperation::QueueTemplate { template }))
    }

    fn queue_inclusion(
        &self,
        unique_id: Uuid,
        inclusion: ServiceRemoteInclusion,
    ) -> ApiFuture<'_, Option<ServiceSnapshot>> {
        Box::pin(self.service_call(unique_id, ServiceOperation::QueueInclusion { inclusion }))
    }

    fn add_deployment(
        &self,
        unique_id: Uuid,
        deployment: ServiceDeployment,
    ) -> ApiFuture<'_, Option<ServiceSnapshot>> {
        Box::pin(self.service_call(unique_id, ServiceOperation::AddDeployment { deployment }))
    }
}

impl NodeOperations for NodeHandle {
    fn list_node_snapshots(&self) -> ApiFuture<'_, Vec<NodeSnapshot>> {
        Box::pin(async move {
            self.call(|node| node.registry().all_snapshots())
                .await
                .unwrap_or_default()
        })
    }

    fn node_snapshot<'a>(&'a self, node_id: &'a str) -> ApiFuture<'a, Option<NodeSnapshot>> {
        let node_id = node_id.to_string();
        Box::pin(async move {
            self.call(move |node| node.registry().snapshot_of(&node_id).cloned())
                .await
                .flatten()
        })
    }

    fn local_snapshot(&self) -> ApiFuture<'_, Option<NodeSnapshot>> {
        Box::pin(async move {
            self.call(|node| node.registry().local_snapshot().cloned())
                .await
                .flatten()
        })
    }

    fn tasks(&self) -> ApiFuture<'_, Vec<ServiceTask>> {
        Box::pin(async move { self.call(|node| node.state().tasks()).await.unwrap_or_default() })
    }

    fn add_task(&self, task: ServiceTask) -> ApiFuture<'_, bool> {
        Box::pin(self.state_call("add task", move |node| node.state_mut().add_task(task)))
    }

    fn remove_task<'a>(&'a self, name: &'a str) -> ApiFuture<'a, bool> {
        let name = name.to_string();
        Box::pin(self.state_call("remove task", move |node| node.state_mut().remove_task(&name)))
    }

    fn groups(&self) -> ApiFuture<'_, Vec<GroupConfiguration>> {
        Box::pin(async move { self.call(|node| node.state().groups()).await.unwrap_or_default() })
    }

    fn add_group(&self, group: GroupConfiguration) -> ApiFuture<'_, bool> {
        Box::pin(self.state_call("add group", move |node| node.state_mut().add_group(group)))
    }

    fn remove_group<'a>(&'a self, name: &'a str) -> ApiFuture<'a, bool> {
        let name = name.to_string();
        Box::pin(self.state_call("remove group", move |node| node.state_mut().remove_group(&name)))
    }

    fn set_permissions(&self, permissions: PermissionSnapshot) -> ApiFuture<'_, bool> {
        Box::pin(self.state_call("store permissions", move |node| {
            node.state_mut().set_permissions(permissions).map(|()| true)
        }))
    }

    fn put_document<'a>(
        &'a self,
        dataset: &'a str,
        key: &'a str,
        document: serde_json::Value,
    ) -> ApiFuture<'a, bool> {
        let (dataset, key) = (dataset.to_string(), key.to_string());
        Box::pin(self.state_call("store document", move |node| {
            node.state_mut()
                .put_document(&dataset, &key, document)
                .map(|()| true)
        }))
    }

    fn remove_document<'a>(&'a self, dataset: &'a str, key: &'a str) -> ApiFuture<'a, bool> {
        let (dataset, key) = (dataset.to_string(), key.to_string());
        Box::pin(self.state_call("remove document", move |node| {
            node.state_mut().remove_document(&dataset, &key)
        }))
    }
}

impl ClusterMessaging for NodeHandle {
    fn register_channel_handler(&self, channel: &str, handler: PacketHandler) {
        self.transport().register_handler(channel, handler);
    }

    fn broadcast(&self, packet: Packet) {
        self.transport().broadcast(packet);
    }

    fn send_channel_message(&self, channel: &str, message: &str, data: serde_json::Value) -> bool {
        let payload = ChannelMessage {
            sender: self.transport().local().id.clone(),
            channel: channel.to_string(),
            message: message.to_string(),
            data,
        };
        match Packet::json(channels::MESSAGES, &payload) {
            Ok(packet) => {
                self.transport().broadcast(packet);
                true
            }
            Err(e) => {
                warn!(%channel, error = %e, "failed to encode channel message");
                false
            }
        }
    }
}
