//! Worker processes.
//!
//! [`ProcessLauncher`] is the seam between the service manager and the
//! operating system. [`OsLauncher`] spawns real child processes through
//! `tokio::process`, pumping their console output into a channel the
//! manager drains once per tick. [`ScriptedLauncher`] stands in for it in
//! tests.
//!
//! Every method on [`ServiceProcess`] is synchronous: the manager runs on
//! the control thread and a stop blocks it until the process exits or the
//! grace period runs out.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fleet_core::types::ServiceId;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

/// Line written to a worker's console to ask it to shut down.
pub const STOP_COMMAND: &str = "stop";

const EXIT_POLL: Duration = Duration::from_millis(25);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to launch one worker process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub service_id: ServiceId,
    pub command: String,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

pub trait ServiceProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Write one line to the process console.
    fn write_line(&mut self, line: &str) -> ServiceResult<()>;

    /// Ask the process to stop, killing it once `grace` has elapsed.
    fn stop(&mut self, grace: Duration) -> ServiceResult<()>;

    fn kill(&mut self) -> ServiceResult<()>;

    /// Console output produced since the last call.
    fn drain_output(&mut self) -> Vec<String>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> ServiceResult<Box<dyn ServiceProcess>>;
}

// ── OS processes ───────────────────────────────────────────────────

/// Spawns workers as child processes of the node.
///
/// Must be called from within a tokio runtime context.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn launch(&self, spec: &LaunchSpec) -> ServiceResult<Box<dyn ServiceProcess>> {
        let name = spec.service_id.name();
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.environment)
            .current_dir(&spec.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServiceError::Launch {
                command: spec.command.clone(),
                source,
            })?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, output_tx));
        }
        let input = child.stdin.take().map(|stdin| {
            let (input_tx, input_rx) = mpsc::unbounded_channel();
            tokio::spawn(feed_input(stdin, input_rx, name.clone()));
            input_tx
        });

        info!(service = %name, pid = ?child.id(), command = %spec.command, "process launched");
        Ok(Box::new(OsProcess {
            name,
            child,
            input,
            output: output_rx,
        }))
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, output: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if output.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "console stream closed");
                break;
            }
        }
    }
}

async fn feed_input(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>, name: String) {
    while let Some(line) = lines.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if let Err(e) = stdin.write_all(&bytes).await {
            debug!(service = %name, error = %e, "console input closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!(service = %name, error = %e, "console input closed");
            break;
        }
    }
}

struct OsProcess {
    name: String,
    child: Child,
    input: Option<mpsc::UnboundedSender<String>>,
    output: mpsc::UnboundedReceiver<String>,
}

impl OsProcess {
    /// Poll until the process exits or `limit` elapses. Returns whether it
    /// exited.
    fn wait_for_exit(&mut self, limit: Duration) -> ServiceResult<bool> {
        let deadline = Instant::now() + limit;
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(EXIT_POLL);
        }
    }
}

impl ServiceProcess for OsProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn write_line(&mut self, line: &str) -> ServiceResult<()> {
        let input = self.input.as_ref().ok_or(ServiceError::InputClosed)?;
        input
            .send(line.to_string())
            .map_err(|_| ServiceError::InputClosed)
    }

    fn stop(&mut self, grace: Duration) -> ServiceResult<()> {
        if !self.is_alive() {
            return Ok(());
        }
        if let Err(e) = self.write_line(STOP_COMMAND) {
            debug!(service = %self.name, error = %e, "could not send stop command");
        }
        if self.wait_for_exit(grace)? {
            debug!(service = %self.name, "process stopped");
            return Ok(());
        }
        warn!(service = %self.name, ?grace, "process ignored stop request, killing");
        self.kill()
    }

    fn kill(&mut self) -> ServiceResult<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.start_kill()?;
        if !self.wait_for_exit(REAP_TIMEOUT)? {
            warn!(service = %self.name, "killed process has not exited yet");
        }
        Ok(())
    }

    fn drain_output(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.output.try_recv() {
            lines.push(line);
        }
        lines
    }
}

// ── Scripted processes ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct ScriptedProcessState {
    alive: bool,
    input: Vec<String>,
    output: Vec<String>,
    stopped: u32,
    killed: u32,
}

#[derive(Debug, Default)]
struct ScriptedState {
    fail_launches: bool,
    launched: Vec<LaunchSpec>,
    processes: HashMap<Uuid, Arc<Mutex<ScriptedProcessState>>>,
}

/// In-memory launcher whose processes run until told otherwise.
///
/// Cloning shares state, so a test can keep a handle while the service
/// manager owns another.
#[derive(Debug, Default, Clone)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_process<T>(
        &self,
        unique_id: Uuid,
        f: impl FnOnce(&mut ScriptedProcessState) -> T,
    ) -> Option<T> {
        let process = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .processes
            .get(&unique_id)
            .cloned()?;
        let mut process = process.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut process))
    }

    /// Make every following launch fail.
    pub fn fail_launches(&self, fail: bool) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_launches = fail;
    }

    /// Every launch request seen so far, in order.
    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .launched
            .clone()
    }

    /// Simulate the worker's process exiting on its own.
    pub fn exit(&self, unique_id: Uuid) -> bool {
        self.with_process(unique_id, |p| p.alive = false).is_some()
    }

    /// Queue a console line as if the worker had printed it.
    pub fn emit(&self, unique_id: Uuid, line: &str) -> bool {
        self.with_process(unique_id, |p| p.output.push(line.to_string()))
            .is_some()
    }

    /// Lines written to the worker's console.
    pub fn input(&self, unique_id: Uuid) -> Vec<String> {
        self.with_process(unique_id, |p| p.input.clone())
            .unwrap_or_default()
    }

    pub fn is_alive(&self, unique_id: Uuid) -> bool {
        self.with_process(unique_id, |p| p.alive).unwrap_or(false)
    }

    /// How often the worker was stopped and killed.
    pub fn stop_counts(&self, unique_id: Uuid) -> (u32, u32) {
        self.with_process(unique_id, |p| (p.stopped, p.killed))
            .unwrap_or_default()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> ServiceResult<Box<dyn ServiceProcess>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_launches {
            return Err(ServiceError::Launch {
                command: spec.command.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
            });
        }
        state.launched.push(spec.clone());

        let process = Arc::new(Mutex::new(ScriptedProcessState {
            alive: true,
            ..ScriptedProcessState::default()
        }));
        state
            .processes
            .insert(spec.service_id.unique_id, process.clone());
        Ok(Box::new(ScriptedProcess {
            pid: state.launched.len() as u32,
            state: process,
        }))
    }
}

struct ScriptedProcess {
    pid: u32,
    state: Arc<Mutex<ScriptedProcessState>>,
}

impl ScriptedProcess {
    fn state(&self) -> std::sync::MutexGuard<'_, ScriptedProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServiceProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        self.state().alive
    }

    fn write_line(&mut self, line: &str) -> ServiceResult<()> {
        let mut state = self.state();
        if !state.alive {
            return Err(ServiceError::NotRunning);
        }
        state.input.push(line.to_string());
        Ok(())
    }

    fn stop(&mut self, _grace: Duration) -> ServiceResult<()> {
        let mut state = self.state();
        state.alive = false;
        state.stopped += 1;
        Ok(())
    }

    fn kill(&mut self) -> ServiceResult<()> {
        let mut state = self.state();
        state.alive = false;
        state.killed += 1;
        Ok(())
    }

    fn drain_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.state().output)
    }
}
