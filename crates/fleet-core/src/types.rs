//! Domain types shared by every Fleet node.
//!
//! Node and service records are immutable snapshots: a change produces a
//! new value that replaces the old one wholesale. Records reference each
//! other by id only (a service names its owning node, a node never holds
//! its services), so every type serializes to plain JSON without cycles.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a manager node.
pub type NodeId = String;

/// Free-form key/value bag attached to snapshots.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Named key-value datasets replicated across the cluster:
/// dataset name → document key → document.
pub type Datasets = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

// ── Addresses ─────────────────────────────────────────────────────

/// Errors raised while parsing a `host:port` pair.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing port in address: {0}")]
    MissingPort(String),

    #[error("invalid port in address: {0}")]
    InvalidPort(String),

    #[error("empty host in address: {0}")]
    EmptyHost(String),
}

/// A `host:port` listener or connect address.
///
/// Serialized as the plain `"host:port"` string so configuration files
/// stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for HostAndPort {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostAndPort> for String {
    fn from(value: HostAndPort) -> Self {
        value.to_string()
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Stable identity of a manager node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    /// Addresses the node accepts peer and worker connections on.
    pub listeners: Vec<HostAndPort>,
}

/// Resource usage of a single OS process.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    /// CPU usage in percent of one core.
    pub cpu_usage: f64,
    pub threads: u32,
}

/// Point-in-time state of a manager node, broadcast to every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Unix timestamp (milliseconds) when the snapshot was taken.
    pub timestamp_ms: u64,
    pub node: NodeDescriptor,
    pub version: String,
    /// Number of workers the node currently owns.
    pub service_count: u32,
    /// Memory actually used by running workers (MiB).
    pub used_memory_mb: u64,
    /// Memory promised to all owned workers (MiB).
    pub reserved_memory_mb: u64,
    /// Memory the node may hand out to workers (MiB).
    pub max_memory_mb: u64,
    /// Usage of the manager process itself.
    pub process: ProcessSnapshot,
}

impl NodeSnapshot {
    /// Unreserved memory capacity. Negative when the node is over-committed.
    pub fn headroom(&self) -> i64 {
        let max = i64::try_from(self.max_memory_mb).unwrap_or(i64::MAX);
        let reserved = i64::try_from(self.reserved_memory_mb).unwrap_or(i64::MAX);
        max.saturating_sub(reserved)
    }

    /// CPU usage weighted by the number of owned workers.
    pub fn load(&self) -> f64 {
        self.process.cpu_usage * f64::from(self.service_count)
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }
}

// ── Service ───────────────────────────────────────────────────────

/// Lifecycle of a worker.
///
/// `Prepared → Running → Stopped → Deleted`, with `Stopped → Running`
/// for restarts and a direct edge from every state to `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLifeCycle {
    Prepared,
    Running,
    Stopped,
    Deleted,
}

impl ServiceLifeCycle {
    /// Whether the state machine has an edge from `self` to `target`.
    pub fn can_transition_to(self, target: ServiceLifeCycle) -> bool {
        use ServiceLifeCycle::*;
        matches!(
            (self, target),
            (Prepared, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Prepared | Running | Stopped, Deleted)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ServiceLifeCycle::Deleted
    }
}

impl fmt::Display for ServiceLifeCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceLifeCycle::Prepared => "prepared",
            ServiceLifeCycle::Running => "running",
            ServiceLifeCycle::Stopped => "stopped",
            ServiceLifeCycle::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

/// Globally unique identity of a worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub unique_id: Uuid,
    pub task_name: String,
    /// Per-task sequence number, starting at 1.
    pub task_service_id: u32,
    /// The node that owns and runs the instance.
    pub node_id: NodeId,
}

impl ServiceId {
    /// Human-readable name, e.g. `Lobby-2`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.task_name, self.task_service_id)
    }
}

/// A template copied into a worker's directory before start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub prefix: String,
    pub name: String,
    /// Storage backend the template lives in (e.g. `local`).
    pub storage: String,
}

impl fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.storage, self.prefix, self.name)
    }
}

/// A remote file downloaded into a worker's directory before start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRemoteInclusion {
    pub url: String,
    pub destination: String,
}

/// A template the worker's files are written back to on stop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub template: ServiceTemplate,
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// How to launch the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessConfiguration {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Memory reserved for the worker (MiB).
    pub max_memory_mb: u64,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Desired template of a worker, supplied at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub task_name: String,
    /// Node that should own the worker. `None` lets placement decide.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub process: ProcessConfiguration,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub includes: Vec<ServiceRemoteInclusion>,
    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,
    /// Preferred listen port. A free port is picked when absent or taken.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub auto_delete_on_stop: bool,
    #[serde(default)]
    pub static_service: bool,
    #[serde(default)]
    pub properties: Properties,
}

impl ServiceConfiguration {
    pub fn new(task_name: impl Into<String>, process: ProcessConfiguration) -> Self {
        Self {
            task_name: task_name.into(),
            node_id: None,
            process,
            groups: Vec::new(),
            templates: Vec::new(),
            includes: Vec::new(),
            deployments: Vec::new(),
            port: None,
            auto_delete_on_stop: false,
            static_service: false,
            properties: Properties::new(),
        }
    }
}

/// Observable state of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub creation_time_ms: u64,
    pub service_id: ServiceId,
    pub address: HostAndPort,
    /// Whether the worker process has connected back to its node.
    pub connected: bool,
    pub lifecycle: ServiceLifeCycle,
    pub process: ProcessSnapshot,
    pub configuration: ServiceConfiguration,
    #[serde(default)]
    pub properties: Properties,
}

impl ServiceSnapshot {
    pub fn unique_id(&self) -> Uuid {
        self.service_id.unique_id
    }

    pub fn owner(&self) -> &str {
        &self.service_id.node_id
    }

    pub fn name(&self) -> String {
        self.service_id.name()
    }

    pub fn task_name(&self) -> &str {
        &self.service_id.task_name
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == ServiceLifeCycle::Running
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.configuration.groups.iter().any(|g| g == group)
    }
}

// ── Tasks and groups ──────────────────────────────────────────────

/// Standing declaration of how many instances of a worker kind should
/// exist cluster-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTask {
    pub name: String,
    #[serde(default)]
    pub min_service_count: u32,
    /// Nodes allowed to host the task. Empty means any node.
    #[serde(default)]
    pub associated_nodes: Vec<NodeId>,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub includes: Vec<ServiceRemoteInclusion>,
    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,
    pub process: ProcessConfiguration,
    #[serde(default)]
    pub start_port: Option<u16>,
    #[serde(default)]
    pub auto_delete_on_stop: bool,
    #[serde(default)]
    pub static_services: bool,
}

impl ServiceTask {
    pub fn new(name: impl Into<String>, process: ProcessConfiguration) -> Self {
        Self {
            name: name.into(),
            min_service_count: 0,
            associated_nodes: Vec::new(),
            maintenance: false,
            groups: Vec::new(),
            templates: Vec::new(),
            includes: Vec::new(),
            deployments: Vec::new(),
            process,
            start_port: None,
            auto_delete_on_stop: true,
            static_services: false,
        }
    }

    /// Whether `node_id` may host instances of this task.
    pub fn admits(&self, node_id: &str) -> bool {
        self.associated_nodes.is_empty() || self.associated_nodes.iter().any(|n| n == node_id)
    }

    /// Build the configuration of a new instance, merging in the templates,
    /// inclusions and deployments of every group the task belongs to.
    pub fn to_configuration(&self, groups: &[GroupConfiguration]) -> ServiceConfiguration {
        let mut config = ServiceConfiguration::new(self.name.clone(), self.process.clone());
        config.groups = self.groups.clone();
        config.templates = self.templates.clone();
        config.includes = self.includes.clone();
        config.deployments = self.deployments.clone();
        config.port = self.start_port;
        config.auto_delete_on_stop = self.auto_delete_on_stop;
        config.static_service = self.static_services;

        for group in groups.iter().filter(|g| self.groups.contains(&g.name)) {
            config.templates.extend(group.templates.iter().cloned());
            config.includes.extend(group.includes.iter().cloned());
            config.deployments.extend(group.deployments.iter().cloned());
        }
        config
    }
}

/// Shared templates, inclusions and deployments for a set of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfiguration {
    pub name: String,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub includes: Vec<ServiceRemoteInclusion>,
    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,
}

impl GroupConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            templates: Vec::new(),
            includes: Vec::new(),
            deployments: Vec::new(),
        }
    }
}

/// Opaque permission data owned by the permission manager and replicated
/// verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    #[serde(default)]
    pub users: Vec<serde_json::Value>,
    #[serde(default)]
    pub groups: Vec<serde_json::Value>,
}

/// Whether `name` is usable for a task or group: ASCII letters, digits,
/// `_`, `.` and `-`, not ending in `-`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Current Unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("Lobby"));
        assert!(is_valid_name("Bed-Wars_2.0"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Lobby-"));
        assert!(!is_valid_name("with space"));
        assert!(!is_valid_name("a/b"));
    }

    fn test_node_snapshot(id: &str, max: u64, reserved: u64, cpu: f64, count: u32) -> NodeSnapshot {
        NodeSnapshot {
            timestamp_ms: 1_000,
            node: NodeDescriptor {
                id: id.to_string(),
                listeners: vec![HostAndPort::new("10.0.0.1", 1410)],
            },
            version: "0.1.0".to_string(),
            service_count: count,
            used_memory_mb: 0,
            reserved_memory_mb: reserved,
            max_memory_mb: max,
            process: ProcessSnapshot {
                cpu_usage: cpu,
                ..ProcessSnapshot::default()
            },
        }
    }

    fn test_service_snapshot() -> ServiceSnapshot {
        let mut config = ServiceConfiguration::new(
            "Lobby",
            ProcessConfiguration {
                command: "java".to_string(),
                args: vec!["-jar".to_string(), "server.jar".to_string()],
                max_memory_mb: 512,
                environment: BTreeMap::new(),
            },
        );
        config.groups.push("Global-Server".to_string());
        config
            .properties
            .insert("motd".to_string(), serde_json::json!("hello"));

        ServiceSnapshot {
            creation_time_ms: 1_000,
            service_id: ServiceId {
                unique_id: Uuid::new_v4(),
                task_name: "Lobby".to_string(),
                task_service_id: 2,
                node_id: "node-1".to_string(),
            },
            address: HostAndPort::new("127.0.0.1", 44955),
            connected: false,
            lifecycle: ServiceLifeCycle::Running,
            process: ProcessSnapshot {
                pid: 42,
                memory_bytes: 1024,
                virtual_memory_bytes: 4096,
                cpu_usage: 12.5,
                threads: 8,
            },
            configuration: config,
            properties: Properties::new(),
        }
    }

    #[test]
    fn host_and_port_parse_and_display() {
        let addr: HostAndPort = "10.0.0.1:1410".parse().unwrap();
        assert_eq!(addr, HostAndPort::new("10.0.0.1", 1410));
        assert_eq!(addr.to_string(), "10.0.0.1:1410");
    }

    #[test]
    fn host_and_port_rejects_garbage() {
        assert!(matches!(
            "no-port".parse::<HostAndPort>(),
            Err(AddressError::MissingPort(_))
        ));
        assert!(matches!(
            "host:99999".parse::<HostAndPort>(),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            ":1410".parse::<HostAndPort>(),
            Err(AddressError::EmptyHost(_))
        ));
    }

    #[test]
    fn host_and_port_serializes_as_string() {
        let json = serde_json::to_string(&HostAndPort::new("node.local", 80)).unwrap();
        assert_eq!(json, "\"node.local:80\"");
    }

    #[test]
    fn headroom_and_load() {
        let snap = test_node_snapshot("a", 10_000, 4_000, 20.0, 5);
        assert_eq!(snap.headroom(), 6_000);
        assert_eq!(snap.load(), 100.0);
    }

    #[test]
    fn headroom_goes_negative_when_overcommitted() {
        let snap = test_node_snapshot("a", 1_000, 1_500, 0.0, 0);
        assert_eq!(snap.headroom(), -500);
    }

    #[test]
    fn headroom_saturates_on_huge_values() {
        let snap = test_node_snapshot("a", u64::MAX, 512, 0.0, 1);
        assert_eq!(snap.headroom(), i64::MAX - 512);

        let snap = test_node_snapshot("a", 1_024, u64::MAX, 0.0, 1);
        assert_eq!(snap.headroom(), 1_024 - i64::MAX);
    }

    #[test]
    fn lifecycle_edges() {
        use ServiceLifeCycle::*;
        assert!(Prepared.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Prepared.can_transition_to(Deleted));
        assert!(Running.can_transition_to(Deleted));
        assert!(Stopped.can_transition_to(Deleted));

        assert!(!Prepared.can_transition_to(Stopped));
        assert!(!Deleted.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(Deleted));
        assert!(Deleted.is_terminal());
    }

    #[test]
    fn service_snapshot_json_is_lossless() {
        let snap = test_service_snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: ServiceSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.name(), "Lobby-2");
        assert!(back.in_group("Global-Server"));
    }

    #[test]
    fn node_snapshot_json_is_lossless() {
        let snap = test_node_snapshot("node-1", 8_192, 1_024, 3.25, 4);
        let json = serde_json::to_vec(&snap).unwrap();
        let back: NodeSnapshot = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn node_snapshot_json_keeps_cpu_bits() {
        for cpu in [11.988575698857451, 0.1 + 0.2, 99.999_999_999_999_99, 1e-300, 37.0 / 3.0] {
            let snap = test_node_snapshot("node-1", 8_192, 1_024, cpu, 3);
            let json = serde_json::to_string(&snap).unwrap();
            let back: NodeSnapshot = serde_json::from_str(&json).unwrap();
            assert_eq!(back.process.cpu_usage.to_bits(), cpu.to_bits(), "cpu {cpu}");
            assert_eq!(back.load().to_bits(), snap.load().to_bits());
        }
    }

    #[test]
    fn task_affinity() {
        let mut task = ServiceTask::new("Lobby", ProcessConfiguration::default());
        assert!(task.admits("any-node"));

        task.associated_nodes = vec!["node-1".to_string()];
        assert!(task.admits("node-1"));
        assert!(!task.admits("node-2"));
    }

    #[test]
    fn task_configuration_merges_group_templates() {
        let mut task = ServiceTask::new("Lobby", ProcessConfiguration::default());
        task.groups = vec!["Global-Server".to_string()];
        task.templates.push(ServiceTemplate {
            prefix: "Lobby".to_string(),
            name: "default".to_string(),
            storage: "local".to_string(),
        });

        let mut group = GroupConfiguration::new("Global-Server");
        group.templates.push(ServiceTemplate {
            prefix: "Global".to_string(),
            name: "bukkit".to_string(),
            storage: "local".to_string(),
        });
        let unrelated = GroupConfiguration::new("Global-Proxy");

        let config = task.to_configuration(&[group, unrelated]);
        assert_eq!(config.task_name, "Lobby");
        assert_eq!(config.templates.len(), 2);
        assert_eq!(config.templates[1].to_string(), "local:Global/bukkit");
        assert!(config.auto_delete_on_stop);
    }
}
