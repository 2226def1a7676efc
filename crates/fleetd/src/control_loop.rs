//! The single-writer control loop.
//!
//! One dedicated thread owns the [`Node`]. Each tick it:
//!
//! 1. drains every queued [`Work`] item in submission order,
//! 2. auto-scales tasks below their minimum (once per second),
//! 3. sweeps workers whose process exited,
//! 4. publishes the local node snapshot (once per second),
//! 5. flushes worker console output into the log caches.
//!
//! A panic inside a tick is logged and the loop carries on with the next
//! one.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::node::{Node, Work};

pub struct ControlLoop {
    node: Node,
    queue: mpsc::UnboundedReceiver<Work>,
    tps: u64,
    interval: Duration,
    tick: u64,
}

impl ControlLoop {
    pub fn new(node: Node, queue: mpsc::UnboundedReceiver<Work>, tps: u32) -> Self {
        let tps = u64::from(tps.max(1));
        Self {
            node,
            queue,
            tps,
            interval: Duration::from_millis(1_000 / tps),
            tick: 0,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    /// Number of ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Run every queued work item. Returns how many ran.
    pub fn drain_queue(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(work) = self.queue.try_recv() {
            work(&mut self.node);
            ran += 1;
        }
        ran
    }

    /// Run one tick, containing any panic it raises.
    pub fn tick(&mut self) {
        let tick = self.tick;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_tick(tick)));
        if let Err(payload) = outcome {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(tick, %message, "control loop tick panicked");
        }
        self.tick += 1;
    }

    fn run_tick(&mut self, tick: u64) {
        let once_per_second = tick % self.tps == 0;

        let ran = self.drain_queue();
        if ran > 0 {
            debug!(tick, ran, "queued work executed");
        }
        if once_per_second {
            self.node.autoscale();
        }
        let swept = self.node.services_mut().sweep();
        if swept > 0 {
            debug!(tick, swept, "exited services swept");
        }
        if once_per_second {
            self.node.publish_snapshot();
        }
        self.node.services_mut().flush_logs();
    }

    /// Tick until `shutdown` flips to true, then delete the local workers
    /// and hand the node back.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Node {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tps = self.tps, "control loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => self.tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        // Work queued right before shutdown still runs.
        self.drain_queue();
        self.node.shutdown();
        info!(ticks = self.tick, "control loop stopped");
        self.node
    }

    /// Move the loop onto its own OS thread, driven by `runtime`.
    pub fn spawn(
        self,
        runtime: Handle,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<JoinHandle<Node>> {
        thread::Builder::new()
            .name("fleet-control".into())
            .spawn(move || runtime.block_on(self.run(shutdown)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleet_core::NodeConfig;
    use fleet_core::types::{ProcessConfiguration, ServiceLifeCycle, ServiceTask};
    use fleet_service::ScriptedLauncher;
    use fleet_state::StateStore;
    use fleet_transport::RecordingSender;

    use crate::probe::FixedProbe;

    fn control_loop(dir: &std::path::Path) -> (ControlLoop, mpsc::UnboundedSender<Work>, ScriptedLauncher) {
        let mut config = NodeConfig::scaffold("node-1");
        config.services.working_dir = dir.to_path_buf();
        config.services.start_port = 30000;
        let launcher = ScriptedLauncher::new();
        let node = Node::new(
            &config,
            StateStore::open_in_memory().unwrap(),
            Arc::new(RecordingSender::new()),
            Arc::new(launcher.clone()),
            Box::new(FixedProbe::default()),
        )
        .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (ControlLoop::new(node, rx, 10), tx, launcher)
    }

    fn task(name: &str, min: u32) -> ServiceTask {
        let mut task = ServiceTask::new(
            name,
            ProcessConfiguration {
                command: "worker".into(),
                args: Vec::new(),
                max_memory_mb: 256,
                environment: Default::default(),
            },
        );
        task.min_service_count = min;
        task
    }

    #[test]
    fn test_work_runs_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, tx, _) = control_loop(dir.path());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            tx.send(Box::new(move |_: &mut Node| order.lock().unwrap().push(i)))
                .unwrap();
        }

        control.tick();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(control.ticks(), 1);
    }

    #[test]
    fn test_work_runs_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, tx, _) = control_loop(dir.path());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        tx.send(Box::new(move |_: &mut Node| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        control.tick();
        control.tick();
        control.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, tx, _) = control_loop(dir.path());
        let runs = Arc::new(AtomicUsize::new(0));

        tx.send(Box::new(|_: &mut Node| panic!("bad work item")))
            .unwrap();
        control.tick();
        assert_eq!(control.ticks(), 1);

        let counter = runs.clone();
        tx.send(Box::new(move |_: &mut Node| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        control.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_autoscale_runs_on_first_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, _tx, launcher) = control_loop(dir.path());
        control.node_mut().state_mut().add_task(task("lobby", 1)).unwrap();

        control.tick();

        let services = control.node().services().local_snapshots();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].lifecycle, ServiceLifeCycle::Running);
        assert_eq!(launcher.launched().len(), 1);
    }

    #[test]
    fn test_autoscale_waits_for_next_second() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, _tx, _) = control_loop(dir.path());
        control.tick();

        control.node_mut().state_mut().add_task(task("lobby", 1)).unwrap();
        for _ in 1..10 {
            control.tick();
        }
        assert_eq!(control.node().services().local_count(), 0);

        control.tick();
        assert_eq!(control.node().services().local_count(), 1);
    }

    #[test]
    fn test_exited_worker_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, _tx, launcher) = control_loop(dir.path());
        let mut lobby = task("lobby", 1);
        lobby.auto_delete_on_stop = false;
        control.node_mut().state_mut().add_task(lobby).unwrap();
        control.tick();

        let id = control.node().services().local_snapshots()[0].unique_id();
        launcher.exit(id);
        control.tick();

        let snapshot = control.node().services().get(&id).unwrap();
        assert_eq!(snapshot.lifecycle, ServiceLifeCycle::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_loop_stops_and_deletes_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, tx, _) = control_loop(dir.path());
        control.node_mut().state_mut().add_task(task("lobby", 1)).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let thread = control.spawn(Handle::current(), shutdown_rx).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (reply, seen) = tokio::sync::oneshot::channel();
        tx.send(Box::new(move |node: &mut Node| {
            let _ = reply.send(node.services().local_count());
        }))
        .unwrap();
        assert_eq!(seen.await.unwrap(), 1);

        shutdown_tx.send_replace(true);
        let node = tokio::task::spawn_blocking(move || thread.join().unwrap())
            .await
            .unwrap();
        assert_eq!(node.services().local_count(), 0);
    }
}
