//! Service manager — owns the local workers and caches everyone else's.
//!
//! The manager keeps two flat tables keyed by the worker's unique id:
//!
//! - `local`: workers this node owns, with their process handle and
//!   console cache. This is the single source of truth for them.
//! - `remote`: the latest broadcast snapshot of every worker owned by a
//!   peer. It may be stale.
//!
//! A worker id is in `local` exactly when the local node is named as its
//! owner. Operations on local workers run directly; operations on remote
//! workers come back as [`Dispatch::Forward`] so the caller can send them
//! to the owner without blocking the control thread.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::NodeConfig;
use fleet_core::protocol::{
    RpcRequest, RpcResponse, ServiceOperation, ServiceRequest, ServiceUpdate, channels,
};
use fleet_core::types::{
    HostAndPort, NodeDescriptor, NodeId, ProcessSnapshot, ServiceConfiguration, ServiceDeployment,
    ServiceId, ServiceLifeCycle, ServiceRemoteInclusion, ServiceSnapshot, ServiceTemplate,
    epoch_millis, is_valid_name,
};
use fleet_transport::{Packet, PacketSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::log_cache::LogCache;
use crate::process::{LaunchSpec, ProcessLauncher, ServiceProcess};

/// Outcome of an operation that may belong to another node.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch<T> {
    /// Ran locally, or could not run at all (`None`).
    Handled(Option<T>),
    /// Owned by a connected peer; send `request` to `node_id`.
    Forward { node_id: NodeId, request: RpcRequest },
}

/// Where an operation on a worker id has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(NodeId),
    /// Owned by a peer that is not connected.
    Unreachable(NodeId),
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub start_port: u16,
    pub working_dir: PathBuf,
    pub stop_timeout: Duration,
    pub log_cache_lines: usize,
    /// Memory the node may promise to its workers (MiB).
    pub max_memory_mb: u64,
    /// Secret handed to workers so they can authenticate back to the node.
    pub connection_secret: String,
}

impl ServiceSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            start_port: config.services.start_port,
            working_dir: config.services.working_dir.clone(),
            stop_timeout: config.stop_timeout(),
            log_cache_lines: config.services.log_cache_lines,
            max_memory_mb: config.max_memory_mb,
            connection_secret: config.cluster.secret.clone(),
        }
    }
}

struct LocalService {
    snapshot: ServiceSnapshot,
    process: Option<Box<dyn ServiceProcess>>,
    logs: LogCache,
    working_dir: PathBuf,
    queued_templates: Vec<ServiceTemplate>,
    queued_inclusions: Vec<ServiceRemoteInclusion>,
    queued_deployments: Vec<ServiceDeployment>,
}

impl LocalService {
    /// Move queued templates, inclusions and deployments into the
    /// configuration the next start uses.
    fn apply_queued(&mut self) {
        let configuration = &mut self.snapshot.configuration;
        configuration.templates.append(&mut self.queued_templates);
        configuration.includes.append(&mut self.queued_inclusions);
        configuration.deployments.append(&mut self.queued_deployments);
    }
}

pub struct ServiceManager {
    node: NodeDescriptor,
    settings: ServiceSettings,
    launcher: Arc<dyn ProcessLauncher>,
    sender: Arc<dyn PacketSender>,
    local: BTreeMap<Uuid, LocalService>,
    remote: BTreeMap<Uuid, ServiceSnapshot>,
}

impl ServiceManager {
    pub fn new(
        node: NodeDescriptor,
        settings: ServiceSettings,
        launcher: Arc<dyn ProcessLauncher>,
        sender: Arc<dyn PacketSender>,
    ) -> Self {
        Self {
            node,
            settings,
            launcher,
            sender,
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.node.id
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    fn publish(&self, snapshot: &ServiceSnapshot) {
        let update = ServiceUpdate {
            snapshot: snapshot.clone(),
        };
        match Packet::json(channels::SERVICES, &update) {
            Ok(packet) => self.sender.broadcast(packet),
            Err(e) => warn!(service = %snapshot.name(), error = %e, "failed to encode service update"),
        }
    }

    // ── Views ──────────────────────────────────────────────────────

    fn snapshots(&self) -> impl Iterator<Item = &ServiceSnapshot> {
        self.local
            .values()
            .map(|s| &s.snapshot)
            .chain(self.remote.values())
    }

    /// Snapshot of any known worker, local or remote.
    pub fn get(&self, unique_id: &Uuid) -> Option<ServiceSnapshot> {
        self.local
            .get(unique_id)
            .map(|s| &s.snapshot)
            .or_else(|| self.remote.get(unique_id))
            .cloned()
    }

    pub fn is_local(&self, unique_id: &Uuid) -> bool {
        self.local.contains_key(unique_id)
    }

    /// Copies of every known worker matching `filter`.
    pub fn list(&self, filter: impl Fn(&ServiceSnapshot) -> bool) -> Vec<ServiceSnapshot> {
        self.snapshots().filter(|s| filter(s)).cloned().collect()
    }

    pub fn local_snapshots(&self) -> Vec<ServiceSnapshot> {
        self.local.values().map(|s| s.snapshot.clone()).collect()
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    /// Instances of `task_name` across the whole cluster, in any state.
    pub fn task_count(&self, task_name: &str) -> usize {
        self.snapshots()
            .filter(|s| s.task_name() == task_name)
            .count()
    }

    /// Memory promised to every local worker.
    pub fn reserved_memory_mb(&self) -> u64 {
        self.local
            .values()
            .map(|s| s.snapshot.configuration.process.max_memory_mb)
            .fold(0, u64::saturating_add)
    }

    /// Memory promised to running local workers.
    pub fn used_memory_mb(&self) -> u64 {
        self.local
            .values()
            .filter(|s| s.snapshot.is_running())
            .map(|s| s.snapshot.configuration.process.max_memory_mb)
            .fold(0, u64::saturating_add)
    }

    // ── Creation ───────────────────────────────────────────────────

    fn next_task_service_id(&self, task_name: &str) -> u32 {
        let taken: BTreeSet<u32> = self
            .snapshots()
            .filter(|s| s.task_name() == task_name)
            .map(|s| s.service_id.task_service_id)
            .collect();
        (1..=u32::MAX).find(|n| !taken.contains(n)).unwrap_or(u32::MAX)
    }

    fn allocate_port(&self, preferred: u16) -> Option<u16> {
        let taken: BTreeSet<u16> = self
            .local
            .values()
            .map(|s| s.snapshot.address.port)
            .collect();
        (preferred..=u16::MAX).find(|p| !taken.contains(p))
    }

    fn advertised_host(&self) -> String {
        match self.node.listeners.first() {
            Some(addr) if addr.host != "0.0.0.0" && addr.host != "::" => addr.host.clone(),
            _ => "127.0.0.1".to_string(),
        }
    }

    /// Define a new local worker in the `Prepared` state.
    ///
    /// Returns `None` if the configuration is invalid, names another node,
    /// or would exceed the node's memory budget.
    pub fn create(&mut self, mut configuration: ServiceConfiguration) -> Option<ServiceSnapshot> {
        let task_name = configuration.task_name.clone();
        if !is_valid_name(&task_name) {
            warn!(task = %task_name, "rejected service with invalid task name");
            return None;
        }
        if let Some(owner) = &configuration.node_id
            && *owner != self.node.id
        {
            warn!(task = %task_name, %owner, "rejected service configured for another node");
            return None;
        }
        if configuration.process.command.trim().is_empty() {
            warn!(task = %task_name, "rejected service without a command");
            return None;
        }
        let memory = configuration.process.max_memory_mb;
        if memory == 0 {
            warn!(task = %task_name, "rejected service without a memory limit");
            return None;
        }
        let reserved = self.reserved_memory_mb();
        if reserved
            .checked_add(memory)
            .is_none_or(|total| total > self.settings.max_memory_mb)
        {
            warn!(
                task = %task_name,
                memory,
                reserved,
                max = self.settings.max_memory_mb,
                "not enough memory for a new service"
            );
            return None;
        }

        let Some(port) = self.allocate_port(configuration.port.unwrap_or(self.settings.start_port))
        else {
            warn!(task = %task_name, "no free port left for a new service");
            return None;
        };

        let service_id = ServiceId {
            unique_id: Uuid::new_v4(),
            task_service_id: self.next_task_service_id(&task_name),
            task_name,
            node_id: self.node.id.clone(),
        };
        configuration.node_id = Some(self.node.id.clone());
        configuration.port = Some(port);

        let name = service_id.name();
        let working_dir = if configuration.static_service {
            self.settings.working_dir.join("static").join(&name)
        } else {
            self.settings
                .working_dir
                .join(format!("{name}-{}", service_id.unique_id.simple()))
        };
        let snapshot = ServiceSnapshot {
            creation_time_ms: epoch_millis(),
            service_id,
            address: HostAndPort::new(self.advertised_host(), port),
            connected: false,
            lifecycle: ServiceLifeCycle::Prepared,
            process: ProcessSnapshot::default(),
            properties: configuration.properties.clone(),
            configuration,
        };

        info!(
            service = %name,
            id = %snapshot.unique_id(),
            port,
            memory,
            "service created"
        );
        self.local.insert(
            snapshot.unique_id(),
            LocalService {
                snapshot: snapshot.clone(),
                process: None,
                logs: LogCache::new(self.settings.log_cache_lines),
                working_dir,
                queued_templates: Vec::new(),
                queued_inclusions: Vec::new(),
                queued_deployments: Vec::new(),
            },
        );
        self.publish(&snapshot);
        Some(snapshot)
    }

    // ── Routing ────────────────────────────────────────────────────

    pub fn route(&self, unique_id: &Uuid, is_connected: impl Fn(&str) -> bool) -> Route {
        if self.local.contains_key(unique_id) {
            return Route::Local;
        }
        match self.remote.get(unique_id) {
            Some(snapshot) if is_connected(snapshot.owner()) => {
                Route::Remote(snapshot.owner().to_string())
            }
            Some(snapshot) => Route::Unreachable(snapshot.owner().to_string()),
            None => Route::Unknown,
        }
    }

    /// Run `request` here if the worker is local, or hand it back for
    /// forwarding when a connected peer owns it.
    pub fn dispatch(
        &mut self,
        request: ServiceRequest,
        is_connected: impl Fn(&str) -> bool,
    ) -> Dispatch<RpcResponse> {
        match self.route(&request.service_id, is_connected) {
            Route::Local => Dispatch::Handled(Some(self.execute(request))),
            Route::Remote(node_id) => {
                debug!(id = %request.service_id, %node_id, "forwarding service operation");
                Dispatch::Forward {
                    node_id,
                    request: RpcRequest::Service(request),
                }
            }
            Route::Unreachable(node_id) => {
                debug!(id = %request.service_id, %node_id, "service owner is not connected");
                Dispatch::Handled(None)
            }
            Route::Unknown => Dispatch::Handled(None),
        }
    }

    /// Create here, or forward to the node the configuration names.
    pub fn dispatch_create(
        &mut self,
        configuration: ServiceConfiguration,
        is_connected: impl Fn(&str) -> bool,
    ) -> Dispatch<RpcResponse> {
        match configuration.node_id.clone() {
            Some(node_id) if node_id != self.node.id => {
                if is_connected(&node_id) {
                    Dispatch::Forward {
                        node_id,
                        request: RpcRequest::CreateService { configuration },
                    }
                } else {
                    debug!(%node_id, "target node for new service is not connected");
                    Dispatch::Handled(None)
                }
            }
            _ => Dispatch::Handled(Some(RpcResponse::Snapshot {
                snapshot: self.create(configuration),
            })),
        }
    }

    /// Run a request against local state only.
    pub fn execute(&mut self, request: ServiceRequest) -> RpcResponse {
        let id = request.service_id;
        let snapshot = match request.operation {
            ServiceOperation::Start => self.start(id),
            ServiceOperation::Stop => self.stop(id),
            ServiceOperation::Kill => self.kill(id),
            ServiceOperation::Restart => self.restart(id),
            ServiceOperation::Delete => self.delete(id),
            ServiceOperation::RunCommand { command } => self.run_command(id, &command),
            ServiceOperation::QueueTemplate { template } => self.queue_template(id, template),
            ServiceOperation::QueueInclusion { inclusion } => self.queue_inclusion(id, inclusion),
            ServiceOperation::AddDeployment { deployment } => self.add_deployment(id, deployment),
            ServiceOperation::CachedLogs => {
                return RpcResponse::Logs {
                    lines: self.cached_logs(&id),
                };
            }
        };
        RpcResponse::Snapshot { snapshot }
    }

    /// Serve a request forwarded by a peer.
    pub fn execute_rpc(&mut self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Service(request) => self.execute(request),
            RpcRequest::CreateService { configuration } => RpcResponse::Snapshot {
                snapshot: self.create(configuration),
            },
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Launch a `Prepared` or `Stopped` worker. A running worker is
    /// returned unchanged; a failed launch leaves it as it was and yields
    /// `None`.
    pub fn start(&mut self, unique_id: Uuid) -> Option<ServiceSnapshot> {
        let node_address = self.node.listeners.first().map(ToString::to_string);
        let service = self.local.get_mut(&unique_id)?;
        match service.snapshot.lifecycle {
            ServiceLifeCycle::Running => return Some(service.snapshot.clone()),
            ServiceLifeCycle::Deleted => return None,
            ServiceLifeCycle::Prepared | ServiceLifeCycle::Stopped => {}
        }

        let name = service.snapshot.name();
        service.apply_queued();
        if let Err(e) = std::fs::create_dir_all(&service.working_dir) {
            warn!(service = %name, dir = %service.working_dir.display(), error = %e, "failed to create working directory");
            return None;
        }

        let spec = launch_spec(service, &self.node.id, node_address, &self.settings);
        let process = match self.launcher.launch(&spec) {
            Ok(process) => process,
            Err(e) => {
                warn!(service = %name, error = %e, "failed to start service");
                return None;
            }
        };

        service.snapshot.process = ProcessSnapshot {
            pid: process.pid().unwrap_or_default(),
            ..ProcessSnapshot::default()
        };
        service.process = Some(process);
        service.snapshot.lifecycle = ServiceLifeCycle::Running;
        let snapshot = service.snapshot.clone();

        info!(service = %name, pid = snapshot.process.pid, port = snapshot.address.port, "service started");
        self.publish(&snapshot);
        Some(snapshot)
    }

    fn halt(
        &mut self,
        unique_id: Uuid,
        force: bool,
        honor_auto_delete: bool,
    ) -> Option<ServiceSnapshot> {
        let grace = self.settings.stop_timeout;
        let service = self.local.get_mut(&unique_id)?;
        if !service.snapshot.is_running() {
            return Some(service.snapshot.clone());
        }

        let name = service.snapshot.name();
        if let Some(mut process) = service.process.take() {
            let result = if force {
                process.kill()
            } else {
                process.stop(grace)
            };
            if let Err(e) = result {
                warn!(service = %name, error = %e, "failed to stop process");
            }
            service.logs.extend(process.drain_output());
        }
        service.snapshot.lifecycle = ServiceLifeCycle::Stopped;
        service.snapshot.connected = false;
        service.snapshot.process = ProcessSnapshot::default();

        let auto_delete = honor_auto_delete && service.snapshot.configuration.auto_delete_on_stop;
        let snapshot = service.snapshot.clone();
        info!(service = %name, forced = force, "service stopped");

        if auto_delete {
            return self.delete(unique_id);
        }
        self.publish(&snapshot);
        Some(snapshot)
    }

    /// Stop a running worker gracefully. Workers flagged auto-delete are
    /// deleted afterwards.
    pub fn stop(&mut self, unique_id: Uuid) -> Option<ServiceSnapshot> {
        self.halt(unique_id, false, true)
    }

    pub fn kill(&mut self, unique_id: Uuid) -> Option<ServiceSnapshot> {
        self.halt(unique_id, true, true)
    }

    /// Stop and start again, without auto-deleting in between.
    pub fn restart(&mut self, unique_id: Uuid) -> Option<ServiceSnapshot> {
        self.halt(unique_id, false, false)?;
        self.start(unique_id)
    }

    /// Stop the worker if needed and drop it. The returned snapshot is in
    /// the `Deleted` state; the id is unknown from then on.
    pub fn delete(&mut self, unique_id: Uuid) -> Option<ServiceSnapshot> {
        let grace = self.settings.stop_timeout;
        let mut service = self.local.remove(&unique_id)?;
        let name = service.snapshot.name();

        if let Some(mut process) = service.process.take()
            && let Err(e) = process.stop(grace)
        {
            warn!(service = %name, error = %e, "failed to stop process");
        }
        service.snapshot.lifecycle = ServiceLifeCycle::Deleted;
        service.snapshot.connected = false;
        service.snapshot.process = ProcessSnapshot::default();

        if !service.snapshot.configuration.static_service
            && service.working_dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&service.working_dir)
        {
            warn!(service = %name, error = %e, "failed to remove working directory");
        }

        info!(service = %name, "service deleted");
        self.publish(&service.snapshot);
        Some(service.snapshot)
    }

    /// Drive a worker towards `target`. `Prepared` is not a valid target.
    pub fn set_lifecycle(
        &mut self,
        unique_id: Uuid,
        target: ServiceLifeCycle,
    ) -> Option<ServiceSnapshot> {
        match target {
            ServiceLifeCycle::Running => self.start(unique_id),
            ServiceLifeCycle::Stopped => self.stop(unique_id),
            ServiceLifeCycle::Deleted => self.delete(unique_id),
            ServiceLifeCycle::Prepared => None,
        }
    }

    /// Delete every local worker.
    pub fn delete_all(&mut self) -> usize {
        let ids: Vec<Uuid> = self.local.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.delete(id))
            .count()
    }

    // ── Console and queued changes ─────────────────────────────────

    /// Write a line to a running worker's console.
    pub fn run_command(&mut self, unique_id: Uuid, command: &str) -> Option<ServiceSnapshot> {
        let service = self.local.get_mut(&unique_id)?;
        let process = service.process.as_mut()?;
        if let Err(e) = process.write_line(command) {
            warn!(service = %service.snapshot.name(), error = %e, "failed to send command");
            return None;
        }
        debug!(service = %service.snapshot.name(), %command, "command sent");
        Some(service.snapshot.clone())
    }

    pub fn queue_template(
        &mut self,
        unique_id: Uuid,
        template: ServiceTemplate,
    ) -> Option<ServiceSnapshot> {
        let service = self.local.get_mut(&unique_id)?;
        debug!(service = %service.snapshot.name(), %template, "template queued");
        service.queued_templates.push(template);
        Some(service.snapshot.clone())
    }

    pub fn queue_inclusion(
        &mut self,
        unique_id: Uuid,
        inclusion: ServiceRemoteInclusion,
    ) -> Option<ServiceSnapshot> {
        let service = self.local.get_mut(&unique_id)?;
        debug!(service = %service.snapshot.name(), url = %inclusion.url, "inclusion queued");
        service.queued_inclusions.push(inclusion);
        Some(service.snapshot.clone())
    }

    pub fn add_deployment(
        &mut self,
        unique_id: Uuid,
        deployment: ServiceDeployment,
    ) -> Option<ServiceSnapshot> {
        let service = self.local.get_mut(&unique_id)?;
        debug!(service = %service.snapshot.name(), template = %deployment.template, "deployment queued");
        service.queued_deployments.push(deployment);
        Some(service.snapshot.clone())
    }

    pub fn cached_logs(&self, unique_id: &Uuid) -> Option<Vec<String>> {
        self.local.get(unique_id).map(|s| s.logs.lines())
    }

    /// Record whether the worker's process has connected back to the node.
    pub fn set_connected(&mut self, unique_id: &Uuid, connected: bool) -> bool {
        let Some(service) = self.local.get_mut(unique_id) else {
            return false;
        };
        if service.snapshot.connected == connected {
            return true;
        }
        service.snapshot.connected = connected;
        let snapshot = service.snapshot.clone();
        debug!(service = %snapshot.name(), connected, "service connection changed");
        self.publish(&snapshot);
        true
    }

    // ── Per-tick work ──────────────────────────────────────────────

    /// Move every running local worker whose process has exited to
    /// `Stopped` (or delete it when flagged auto-delete). Returns how many
    /// exited.
    pub fn sweep(&mut self) -> usize {
        let exited: Vec<Uuid> = self
            .local
            .iter_mut()
            .filter_map(|(id, s)| {
                let alive = s.process.as_mut().is_some_and(|p| p.is_alive());
                (s.snapshot.is_running() && !alive).then_some(*id)
            })
            .collect();

        for id in &exited {
            if let Some(service) = self.local.get(id) {
                info!(service = %service.snapshot.name(), "service process exited");
            }
            self.halt(*id, false, true);
        }
        exited.len()
    }

    /// Move buffered console output of every local worker into its log
    /// cache. Returns the number of lines moved.
    pub fn flush_logs(&mut self) -> usize {
        let mut flushed = 0;
        for service in self.local.values_mut() {
            if let Some(process) = service.process.as_mut() {
                let lines = process.drain_output();
                flushed += lines.len();
                service.logs.extend(lines);
            }
        }
        flushed
    }

    // ── Remote workers ─────────────────────────────────────────────

    /// Store a snapshot broadcast by the worker's owner. `Deleted`
    /// snapshots drop the record. Locally owned workers are never
    /// overwritten.
    pub fn apply_remote(&mut self, snapshot: ServiceSnapshot) -> bool {
        if snapshot.owner() == self.node.id {
            debug!(service = %snapshot.name(), "ignoring remote update for a local service");
            return false;
        }
        let id = snapshot.unique_id();
        if snapshot.lifecycle == ServiceLifeCycle::Deleted {
            return self.remote.remove(&id).is_some();
        }
        self.remote.insert(id, snapshot);
        true
    }

    /// Replace everything cached for `node_id` with `services`.
    pub fn replace_remote(&mut self, node_id: &str, services: Vec<ServiceSnapshot>) -> usize {
        self.forget_node(node_id);
        let mut applied = 0;
        for snapshot in services.into_iter().filter(|s| s.owner() == node_id) {
            if self.apply_remote(snapshot) {
                applied += 1;
            }
        }
        applied
    }

    /// Drop every cached worker owned by `node_id`.
    pub fn forget_node(&mut self, node_id: &str) -> usize {
        let before = self.remote.len();
        self.remote.retain(|_, s| s.owner() != node_id);
        let dropped = before - self.remote.len();
        if dropped > 0 {
            debug!(%node_id, dropped, "dropped cached services of node");
        }
        dropped
    }
}

/// Operation equivalent to driving a worker towards `target`.
pub fn lifecycle_operation(target: ServiceLifeCycle) -> Option<ServiceOperation> {
    match target {
        ServiceLifeCycle::Running => Some(ServiceOperation::Start),
        ServiceLifeCycle::Stopped => Some(ServiceOperation::Stop),
        ServiceLifeCycle::Deleted => Some(ServiceOperation::Delete),
        ServiceLifeCycle::Prepared => None,
    }
}

fn launch_spec(
    service: &LocalService,
    node_id: &str,
    node_address: Option<String>,
    settings: &ServiceSettings,
) -> LaunchSpec {
    let snapshot = &service.snapshot;
    let process = &snapshot.configuration.process;

    let mut environment = process.environment.clone();
    environment.insert("FLEET_SERVICE_ID".into(), snapshot.unique_id().to_string());
    environment.insert("FLEET_SERVICE_NAME".into(), snapshot.name());
    environment.insert("FLEET_TASK".into(), snapshot.task_name().to_string());
    environment.insert(
        "FLEET_SERVICE_NUMBER".into(),
        snapshot.service_id.task_service_id.to_string(),
    );
    environment.insert("FLEET_NODE_ID".into(), node_id.to_string());
    if let Some(address) = node_address {
        environment.insert("FLEET_NODE_ADDRESS".into(), address);
    }
    environment.insert("FLEET_SERVICE_PORT".into(), snapshot.address.port.to_string());
    environment.insert("FLEET_MAX_MEMORY_MB".into(), process.max_memory_mb.to_string());
    environment.insert("FLEET_CONNECTION_KEY".into(), settings.connection_secret.clone());

    LaunchSpec {
        service_id: snapshot.service_id.clone(),
        command: process.command.clone(),
        args: process.args.clone(),
        environment,
        working_dir: service.working_dir.clone(),
    }
}
