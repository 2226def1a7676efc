//! Typed messages carried on each cluster channel.
//!
//! Every packet payload is the JSON encoding of exactly one of the types
//! below, chosen by the packet's channel:
//!
//! | channel           | payload                              |
//! |-------------------|--------------------------------------|
//! | `fleet:auth`      | [`AuthRequest`] / [`AuthResponse`]   |
//! | `fleet:cluster`   | [`ClusterMessage`]                   |
//! | `fleet:services`  | [`ServiceUpdate`]                    |
//! | `fleet:rpc`       | [`RpcRequest`] / [`RpcResponse`]     |
//! | `fleet:messages`  | [`ChannelMessage`]                   |

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    Datasets, GroupConfiguration, NodeDescriptor, NodeId, NodeSnapshot, PermissionSnapshot,
    ServiceConfiguration, ServiceDeployment, ServiceId, ServiceRemoteInclusion, ServiceSnapshot,
    ServiceTask, ServiceTemplate,
};

pub mod channels {
    pub const AUTH: &str = "fleet:auth";
    pub const CLUSTER: &str = "fleet:cluster";
    pub const SERVICES: &str = "fleet:services";
    pub const RPC: &str = "fleet:rpc";
    pub const MESSAGES: &str = "fleet:messages";
}

// ── Handshake ─────────────────────────────────────────────────────

/// First packet sent by the dialing side of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthRequest {
    Node {
        node: NodeDescriptor,
        secret: String,
    },
    Service {
        service_id: ServiceId,
        secret: String,
    },
}

impl AuthRequest {
    pub fn secret(&self) -> &str {
        match self {
            AuthRequest::Node { secret, .. } | AuthRequest::Service { secret, .. } => secret,
        }
    }
}

/// Listener's verdict on an [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub accepted: bool,
    /// Identity of the accepting node.
    pub node: Option<NodeDescriptor>,
}

// ── Cluster state ─────────────────────────────────────────────────

/// Replicated cluster state. Every list variant is a full overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    NodeSnapshot { snapshot: NodeSnapshot },
    SetTasks { tasks: Vec<ServiceTask> },
    SetGroups { groups: Vec<GroupConfiguration> },
    SetPermissions { permissions: PermissionSnapshot },
    SetDatasets { datasets: Datasets },
    /// Every worker the sender owns, pushed once when a peer connects.
    SetGlobalServices { services: Vec<ServiceSnapshot> },
}

/// A worker snapshot changed on its owning node.
///
/// A snapshot in the `deleted` state tells receivers to drop the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub snapshot: ServiceSnapshot,
}

// ── Request/response ──────────────────────────────────────────────

/// An operation on an existing worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceOperation {
    Start,
    Stop,
    Kill,
    Restart,
    Delete,
    RunCommand { command: String },
    QueueTemplate { template: ServiceTemplate },
    QueueInclusion { inclusion: ServiceRemoteInclusion },
    AddDeployment { deployment: ServiceDeployment },
    CachedLogs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service_id: Uuid,
    #[serde(flatten)]
    pub operation: ServiceOperation,
}

/// Request forwarded to the node that owns a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    Service(ServiceRequest),
    CreateService { configuration: ServiceConfiguration },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    Snapshot { snapshot: Option<ServiceSnapshot> },
    Logs { lines: Option<Vec<String>> },
    Error { message: String },
}

// ── Application messaging ─────────────────────────────────────────

/// Free-form message fanned out to peers and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub sender: NodeId,
    pub channel: String,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostAndPort;

    #[test]
    fn test_auth_request_tagging() {
        let request = AuthRequest::Node {
            node: NodeDescriptor {
                id: "node-1".into(),
                listeners: vec![HostAndPort::new("127.0.0.1", 1410)],
            },
            secret: "s3cret".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "node");
        assert_eq!(json["node"]["listeners"][0], "127.0.0.1:1410");

        let back: AuthRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.secret(), "s3cret");
    }

    #[test]
    fn test_service_request_flattens_operation() {
        let id = Uuid::new_v4();
        let request = RpcRequest::Service(ServiceRequest {
            service_id: id,
            operation: ServiceOperation::RunCommand {
                command: "say hi".into(),
            },
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "service");
        assert_eq!(json["op"], "run_command");
        assert_eq!(json["command"], "say hi");

        let back: RpcRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_unit_operation_roundtrip() {
        let request = ServiceRequest {
            service_id: Uuid::new_v4(),
            operation: ServiceOperation::CachedLogs,
        };
        let bytes = serde_json::to_vec(&request).unwrap();
        let back: ServiceRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_cluster_message_tag() {
        let msg = ClusterMessage::SetTasks { tasks: Vec::new() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"set_tasks","tasks":[]}"#);
    }

    #[test]
    fn test_rpc_response_empty_snapshot() {
        let json = serde_json::to_string(&RpcResponse::Snapshot { snapshot: None }).unwrap();
        let back: RpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RpcResponse::Snapshot { snapshot: None });
    }
}
