//! Single-node scenarios.
//!
//! A node runs with a scripted process launcher and a recording packet
//! sink, so nothing is spawned and nothing goes over the network. Most
//! tests tick the control loop by hand; the API tests run it on its own
//! thread behind a `NodeHandle`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_core::NodeConfig;
use fleet_core::protocol::{ServiceUpdate, channels};
use fleet_core::types::{
    GroupConfiguration, ProcessConfiguration, ServiceLifeCycle, ServiceSnapshot, ServiceTask,
};
use fleet_service::ScriptedLauncher;
use fleet_state::StateStore;
use fleet_transport::{RecordingSender, Transport, TransportConfig};
use fleetd::{
    ControlLoop, FixedProbe, Node, NodeHandle, NodeOperations, ServiceOperations, Work,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

struct Harness {
    control: ControlLoop,
    queue: mpsc::UnboundedSender<Work>,
    launcher: ScriptedLauncher,
    sink: Arc<RecordingSender>,
    _dir: tempfile::TempDir,
}

fn config(dir: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::scaffold("node-1");
    config.services.working_dir = dir.join("services");
    config.services.start_port = 30000;
    config.max_memory_mb = 1024;
    config
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new();
    let sink = Arc::new(RecordingSender::new());
    let node = Node::new(
        &config(dir.path()),
        StateStore::open_in_memory().unwrap(),
        sink.clone(),
        Arc::new(launcher.clone()),
        Box::new(FixedProbe::with_cpu(5.0)),
    )
    .unwrap();
    let (queue, rx) = mpsc::unbounded_channel();
    Harness {
        control: ControlLoop::new(node, rx, 10),
        queue,
        launcher,
        sink,
        _dir: dir,
    }
}

fn task(name: &str, min: u32, memory: u64) -> ServiceTask {
    let mut task = ServiceTask::new(
        name,
        ProcessConfiguration {
            command: "lobby-server".into(),
            args: vec!["--nogui".into()],
            max_memory_mb: memory,
            environment: Default::default(),
        },
    );
    task.min_service_count = min;
    task
}

// ── Auto-scaling ───────────────────────────────────────────────

#[test]
fn task_below_minimum_is_started_on_first_tick() {
    let mut h = harness();
    h.queue
        .send(Box::new(|node: &mut Node| {
            node.state_mut().add_task(task("Lobby", 1, 256)).unwrap();
        }))
        .unwrap();

    h.control.tick();

    let services = h.control.node().services().list(|s| s.task_name() == "Lobby");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name(), "Lobby-1");
    assert_eq!(services[0].lifecycle, ServiceLifeCycle::Running);
    assert_eq!(services[0].address.port, 30000);
    assert_eq!(h.launcher.launched().len(), 1);
    assert_eq!(h.launcher.launched()[0].command, "lobby-server");
}

#[test]
fn one_instance_per_task_per_evaluation() {
    let mut h = harness();
    h.control
        .node_mut()
        .state_mut()
        .add_task(task("Lobby", 3, 128))
        .unwrap();

    h.control.tick();
    assert_eq!(h.control.node().services().task_count("Lobby"), 1);

    for _ in 0..10 {
        h.control.tick();
    }
    assert_eq!(h.control.node().services().task_count("Lobby"), 2);

    for _ in 0..10 {
        h.control.tick();
    }
    assert_eq!(h.control.node().services().task_count("Lobby"), 3);

    for _ in 0..30 {
        h.control.tick();
    }
    let names: Vec<String> = h
        .control
        .node()
        .services()
        .local_snapshots()
        .iter()
        .map(|s| s.name())
        .collect();
    assert_eq!(names.len(), 3);
    for expected in ["Lobby-1", "Lobby-2", "Lobby-3"] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
}

#[test]
fn maintenance_and_foreign_tasks_are_left_alone() {
    let mut h = harness();
    let mut maintenance = task("Proxy", 1, 128);
    maintenance.maintenance = true;
    let mut pinned = task("Build", 1, 128);
    pinned.associated_nodes = vec!["node-9".into()];
    {
        let state = h.control.node_mut().state_mut();
        state.add_task(maintenance).unwrap();
        state.add_task(pinned).unwrap();
    }

    h.control.tick();
    assert_eq!(h.control.node().services().local_count(), 0);
}

#[test]
fn memory_budget_caps_auto_scaling() {
    let mut h = harness();
    h.control
        .node_mut()
        .state_mut()
        .add_task(task("Game", 5, 400))
        .unwrap();

    for _ in 0..50 {
        h.control.tick();
    }
    // 1024 MiB fit two instances of 400 MiB.
    assert_eq!(h.control.node().services().local_count(), 2);
    assert_eq!(h.control.node().services().reserved_memory_mb(), 800);
}

#[test]
fn failed_launch_keeps_instance_prepared() {
    let mut h = harness();
    h.launcher.fail_launches(true);
    h.control
        .node_mut()
        .state_mut()
        .add_task(task("Lobby", 1, 128))
        .unwrap();

    h.control.tick();
    let services = h.control.node().services().local_snapshots();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].lifecycle, ServiceLifeCycle::Prepared);

    // The prepared instance counts towards the minimum.
    for _ in 0..10 {
        h.control.tick();
    }
    assert_eq!(h.control.node().services().local_count(), 1);
}

// ── Work queue ─────────────────────────────────────────────────

#[test]
fn queued_work_runs_before_scheduling_in_the_same_tick() {
    let mut h = harness();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    h.queue
        .send(Box::new(move |node: &mut Node| {
            node.state_mut().add_task(task("Lobby", 1, 128)).unwrap();
            log.lock().unwrap().push(node.services().local_count());
        }))
        .unwrap();
    let log = seen.clone();
    h.queue
        .send(Box::new(move |node: &mut Node| {
            log.lock().unwrap().push(node.services().local_count());
        }))
        .unwrap();

    h.control.tick();

    assert_eq!(*seen.lock().unwrap(), vec![0, 0]);
    assert_eq!(h.control.node().services().local_count(), 1);
}

// ── Snapshots and propagation ──────────────────────────────────

#[test]
fn snapshot_reflects_running_services() {
    let mut h = harness();
    h.control
        .node_mut()
        .state_mut()
        .add_task(task("Lobby", 1, 256))
        .unwrap();
    h.control.tick();

    let local = h.control.node().registry().local_snapshot().unwrap().clone();
    assert_eq!(local.service_count, 1);
    assert_eq!(local.reserved_memory_mb, 256);
    assert_eq!(local.used_memory_mb, 256);
    assert_eq!(local.max_memory_mb, 1024);
    assert_eq!(local.headroom(), 768);
    assert_eq!(local.load(), 5.0);

    let previous = h.control.node().registry().previous_local_snapshot().unwrap();
    assert_eq!(previous.service_count, 0);
}

#[test]
fn service_changes_are_broadcast() {
    let mut h = harness();
    h.control
        .node_mut()
        .state_mut()
        .add_task(task("Lobby", 1, 256))
        .unwrap();
    h.sink.take();

    h.control.tick();

    let updates: Vec<ServiceUpdate> = h.sink.decoded(channels::SERVICES);
    let states: Vec<ServiceLifeCycle> = updates.iter().map(|u| u.snapshot.lifecycle).collect();
    assert_eq!(states, vec![ServiceLifeCycle::Prepared, ServiceLifeCycle::Running]);
}

#[test]
fn console_output_reaches_the_log_cache() {
    let mut h = harness();
    h.control
        .node_mut()
        .state_mut()
        .add_task(task("Lobby", 1, 256))
        .unwrap();
    h.control.tick();

    let id = h.control.node().services().local_snapshots()[0].unique_id();
    h.launcher.emit(id, "Done (1.2s)!");
    h.control.tick();

    let logs = h.control.node().services().cached_logs(&id).unwrap();
    assert_eq!(logs, vec!["Done (1.2s)!".to_string()]);
}

#[test]
fn exited_auto_delete_service_is_replaced() {
    let mut h = harness();
    h.control
        .node_mut()
        .state_mut()
        .add_task(task("Lobby", 1, 256))
        .unwrap();
    h.control.tick();
    let first = h.control.node().services().local_snapshots()[0].unique_id();

    h.launcher.exit(first);
    h.control.tick();
    assert!(h.control.node().services().get(&first).is_none());

    for _ in 0..9 {
        h.control.tick();
    }
    let services = h.control.node().services().local_snapshots();
    assert_eq!(services.len(), 1);
    assert_ne!(services[0].unique_id(), first);
    assert_eq!(services[0].name(), "Lobby-1");
}

// ── API over a running loop ────────────────────────────────────

struct Running {
    handle: NodeHandle,
    launcher: ScriptedLauncher,
    shutdown: watch::Sender<bool>,
    thread: std::thread::JoinHandle<Node>,
    _dir: tempfile::TempDir,
}

fn running() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let transport = Transport::new(TransportConfig::new(config.local_descriptor(), "secret"));
    let launcher = ScriptedLauncher::new();
    let node = Node::new(
        &config,
        StateStore::open_in_memory().unwrap(),
        Arc::new(transport.clone()),
        Arc::new(launcher.clone()),
        Box::new(FixedProbe::default()),
    )
    .unwrap();

    let (queue, rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let thread = ControlLoop::new(node, rx, 20)
        .spawn(Handle::current(), shutdown_rx)
        .unwrap();
    Running {
        handle: NodeHandle::new(queue, transport, Duration::from_secs(1)),
        launcher,
        shutdown,
        thread,
        _dir: dir,
    }
}

impl Running {
    async fn stop(self) -> Node {
        self.shutdown.send_replace(true);
        tokio::task::spawn_blocking(move || self.thread.join().unwrap())
            .await
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn api_drives_service_lifecycle() {
    let node = running();
    let handle = &node.handle;

    let mut config = task("Lobby", 0, 256).to_configuration(&[]);
    config.auto_delete_on_stop = false;
    let created = handle.create_service(config).await.unwrap();
    assert_eq!(created.lifecycle, ServiceLifeCycle::Prepared);
    let id = created.unique_id();

    let started = handle
        .set_lifecycle(id, ServiceLifeCycle::Running)
        .await
        .unwrap();
    assert_eq!(started.lifecycle, ServiceLifeCycle::Running);

    let sent = handle.send_command(id, "say hello").await.unwrap();
    assert!(sent.is_running());
    assert_eq!(node.launcher.input(id), vec!["say hello".to_string()]);

    let stopped = handle
        .set_lifecycle(id, ServiceLifeCycle::Stopped)
        .await
        .unwrap();
    assert_eq!(stopped.lifecycle, ServiceLifeCycle::Stopped);

    let listed = handle
        .list_services(Box::new(|s: &ServiceSnapshot| s.task_name() == "Lobby"))
        .await;
    assert_eq!(listed.len(), 1);

    let deleted = handle
        .set_lifecycle(id, ServiceLifeCycle::Deleted)
        .await
        .unwrap();
    assert_eq!(deleted.lifecycle, ServiceLifeCycle::Deleted);
    assert!(handle.service_snapshot(id).await.is_none());
    assert!(handle.cached_logs(id).await.is_none());
    assert!(
        handle
            .set_lifecycle(id, ServiceLifeCycle::Running)
            .await
            .is_none()
    );

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn api_task_added_at_runtime_is_auto_scaled() {
    let node = running();
    let handle = node.handle.clone();

    assert!(handle.add_task(task("Lobby", 1, 256)).await);
    assert!(!handle.add_task(task("bad name!", 1, 256)).await);
    assert_eq!(handle.tasks().await.len(), 1);

    let mut running_count = 0;
    for _ in 0..40 {
        running_count = handle
            .list_services(Box::new(|s: &ServiceSnapshot| s.is_running()))
            .await
            .len();
        if running_count == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(running_count, 1);

    let snapshots = handle.list_node_snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].node_id(), "node-1");
    assert!(handle.node_snapshot("node-2").await.is_none());

    let stopped = node.stop().await;
    assert_eq!(stopped.services().local_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn api_replicated_state_operations() {
    let node = running();
    let handle = &node.handle;

    assert!(
        handle
            .put_document("motd", "default", serde_json::json!({"text": "hi"}))
            .await
    );
    assert!(handle.remove_document("motd", "default").await);
    assert!(!handle.remove_document("motd", "default").await);

    assert!(
        handle
            .add_group(GroupConfiguration::new("Global"))
            .await
    );
    assert_eq!(handle.groups().await.len(), 1);
    assert!(handle.remove_group("Global").await);
    assert!(!handle.remove_group("Global").await);

    assert!(handle.create_service_for_task("Missing").await.is_none());

    node.stop().await;
}
