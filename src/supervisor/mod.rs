//! Process Supervisor
//!
//! Owns the lifecycle of one plugin server process: start, health probing,
//! crash detection with exponential-backoff restarts, and shutdown.
//!
//! [`start`] brings the process up and hands back a [`SupervisorHandle`].
//! From then on a single supervision task owns the child; the handle only
//! observes (state watch, exit-event stream) and requests a stop.

pub mod process;
pub mod query;
pub mod state;

pub use query::query;
pub use state::{Lifecycle, ProcessState, RestartDecision};

use crate::config::PluginServerDefinition;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

const EXIT_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to start plugin server '{server}': {reason}")]
    SpawnFailed { server: String, reason: String },

    #[error("Plugin server '{server}' did not accept connections within {timeout:?}")]
    StartupTimeout { server: String, timeout: Duration },

    #[error("Query of plugin server '{server}' failed: {reason}")]
    QueryFailed { server: String, reason: String },

    #[error("Query of plugin server '{server}' timed out after {timeout:?}")]
    QueryTimeout { server: String, timeout: Duration },

    #[error("Query of plugin server '{server}' returned unreadable output: {reason}")]
    QueryParseError { server: String, reason: String },
}

/// Snapshot published on every lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restarts: u32,
}

/// A plugin server process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    pub server: String,
    pub pid: Option<u32>,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// State the lifecycle moved to because of this exit
    pub state: ProcessState,
    pub restarts: u32,
}

/// Observer/controller for one supervised plugin server.
pub struct SupervisorHandle {
    name: String,
    socket: PathBuf,
    status_rx: watch::Receiver<ProcessStatus>,
    exit_rx: broadcast::Receiver<ProcessExitEvent>,
    stop_tx: mpsc::Sender<Duration>,
    stop_grace: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status_rx.borrow()
    }

    pub fn state(&self) -> ProcessState {
        self.status().state
    }

    /// Receiver that sees every published status
    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status_rx.clone()
    }

    /// Wait until the state satisfies `pred`, or supervision has ended.
    pub async fn wait_for_state<F>(&self, mut pred: F) -> ProcessState
    where
        F: FnMut(ProcessState) -> bool,
    {
        let mut rx = self.status_rx.clone();
        let reached = rx.wait_for(|status| pred(status.state)).await.map(|s| s.state);
        match reached {
            Ok(state) => state,
            Err(_) => rx.borrow().state,
        }
    }

    /// Exit events from now on. The stream ends with the supervision task.
    pub fn monitor(&self) -> impl Stream<Item = ProcessExitEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.exit_rx.resubscribe()).filter_map(|event| event.ok())
    }

    /// Stop the process: SIGTERM, SIGKILL after `graceful_deadline`.
    /// The socket file is removed in every case.
    pub async fn stop(&self, graceful_deadline: Duration) {
        let _ = self.stop_tx.send(graceful_deadline).await;
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match task {
            Some(task) => {
                let _ = task.await;
            }
            None => {
                self.wait_for_state(|s| s.is_terminal()).await;
            }
        }
        process::remove_socket(&self.socket);
    }

    /// Stop with the configured grace period
    pub async fn shutdown(&self) {
        self.stop(self.stop_grace).await
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // Dropping the child inside the task kills it
            task.abort();
        }
    }
}

/// Start the plugin server and begin supervising it.
pub async fn start(definition: PluginServerDefinition) -> Result<SupervisorHandle, SupervisorError> {
    let mut lifecycle = Lifecycle::new(definition.restart.clone());
    lifecycle.on_spawn();
    let child = process::spawn_and_wait(&definition).await?;
    lifecycle.on_ready(Instant::now());

    let status = ProcessStatus {
        state: lifecycle.state(),
        pid: child.id(),
        restarts: 0,
    };
    info!(plugin_server = %definition.name, pid = ?status.pid, socket = %definition.socket.display(), "Plugin server ready");

    let (status_tx, status_rx) = watch::channel(status);
    let (exit_tx, exit_rx) = broadcast::channel(EXIT_EVENT_CAPACITY);
    let (stop_tx, stop_rx) = mpsc::channel(1);

    let handle = SupervisorHandle {
        name: definition.name.clone(),
        socket: definition.socket.clone(),
        status_rx,
        exit_rx,
        stop_tx,
        stop_grace: definition.restart.stop_grace(),
        task: Mutex::new(None),
    };

    let supervision = Supervision {
        definition,
        lifecycle,
        status_tx,
        exit_tx,
        stop_rx,
    };
    let task = tokio::spawn(supervision.run(child));
    *handle.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    Ok(handle)
}

enum Wake {
    Exited(Option<ExitStatus>),
    Stop(Duration),
}

/// State owned by the supervision task
struct Supervision {
    definition: PluginServerDefinition,
    lifecycle: Lifecycle,
    status_tx: watch::Sender<ProcessStatus>,
    exit_tx: broadcast::Sender<ProcessExitEvent>,
    stop_rx: mpsc::Receiver<Duration>,
}

impl Supervision {
    fn publish(&self, pid: Option<u32>) {
        self.status_tx.send_replace(ProcessStatus {
            state: self.lifecycle.state(),
            pid,
            restarts: self.lifecycle.restarts(),
        });
    }

    fn report_exit(&self, pid: Option<u32>, status: Option<ExitStatus>) {
        let _ = self.exit_tx.send(ProcessExitEvent {
            server: self.definition.name.clone(),
            pid,
            code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            state: self.lifecycle.state(),
            restarts: self.lifecycle.restarts(),
        });
    }

    fn health_probe(&self) -> Option<Interval> {
        self.definition.restart.health_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        })
    }

    async fn run(mut self, mut child: Child) {
        let name = self.definition.name.clone();
        loop {
            let pid = child.id();
            let wake = self.watch_running(&mut child, pid).await;

            match wake {
                Wake::Stop(grace) => {
                    self.lifecycle.on_stop_requested();
                    self.publish(pid);
                    let status = process::terminate(&mut child, grace).await;
                    process::remove_socket(&self.definition.socket);
                    self.lifecycle.on_stopped();
                    self.publish(None);
                    self.report_exit(pid, status);
                    info!(plugin_server = %name, "Plugin server stopped");
                    return;
                }
                Wake::Exited(status) => {
                    let decision = self.lifecycle.on_exit(Instant::now());
                    self.publish(None);
                    self.report_exit(pid, status);
                    let exit = status
                        .as_ref()
                        .map(process::describe_exit)
                        .unwrap_or_else(|| "unknown status".to_string());

                    match self.restart(decision, &exit).await {
                        Some(next) => child = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Wait for the running process to exit or a stop request, probing
    /// health in between.
    async fn watch_running(&mut self, child: &mut Child, pid: Option<u32>) -> Wake {
        let mut probe = self.health_probe();
        loop {
            tokio::select! {
                status = child.wait() => return Wake::Exited(status.ok()),
                request = self.stop_rx.recv() => {
                    // A dropped handle stops with the configured grace
                    return Wake::Stop(request.unwrap_or_else(|| self.definition.restart.stop_grace()));
                }
                _ = tick(&mut probe) => {
                    let healthy = process::probe(&self.definition.socket).await;
                    if self.lifecycle.on_probe(healthy) {
                        if healthy {
                            info!(plugin_server = %self.definition.name, "Plugin server healthy again");
                        } else {
                            warn!(plugin_server = %self.definition.name, "Plugin server failed health probe");
                        }
                        self.publish(pid);
                    }
                }
            }
        }
    }

    /// Run restart attempts until one comes up, the budget is exhausted, or
    /// a stop is requested.
    async fn restart(&mut self, mut decision: RestartDecision, exit: &str) -> Option<Child> {
        let name = self.definition.name.clone();
        loop {
            match decision {
                RestartDecision::None => {
                    process::remove_socket(&self.definition.socket);
                    return None;
                }
                RestartDecision::GiveUp { restarts } => {
                    error!(plugin_server = %name, restarts, last_exit = %exit, "Plugin server keeps crashing, giving up");
                    process::remove_socket(&self.definition.socket);
                    return None;
                }
                RestartDecision::Restart { after, attempt } => {
                    warn!(plugin_server = %name, attempt, backoff = ?after, last_exit = %exit, "Plugin server exited, restarting");

                    tokio::select! {
                        _ = tokio::time::sleep(after) => {}
                        _ = self.stop_rx.recv() => {
                            self.lifecycle.on_stopped();
                            self.publish(None);
                            process::remove_socket(&self.definition.socket);
                            info!(plugin_server = %name, "Plugin server stopped during backoff");
                            return None;
                        }
                    }

                    self.lifecycle.on_spawn();
                    self.publish(None);
                    // Dropping the pending spawn kills the half-started child
                    let spawned = tokio::select! {
                        spawned = process::spawn_and_wait(&self.definition) => spawned,
                        _ = self.stop_rx.recv() => {
                            process::remove_socket(&self.definition.socket);
                            self.lifecycle.on_stopped();
                            self.publish(None);
                            info!(plugin_server = %name, attempt, "Plugin server stopped during restart");
                            return None;
                        }
                    };
                    match spawned {
                        Ok(child) => {
                            self.lifecycle.on_ready(Instant::now());
                            self.publish(child.id());
                            info!(plugin_server = %name, pid = ?child.id(), attempt, "Plugin server restarted");
                            return Some(child);
                        }
                        Err(e) => {
                            warn!(plugin_server = %name, attempt, error = %e, "Restart attempt failed");
                            decision = self.lifecycle.on_exit(Instant::now());
                            self.publish(None);
                        }
                    }
                }
            }
        }
    }
}

async fn tick(probe: &mut Option<Interval>) {
    match probe {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
