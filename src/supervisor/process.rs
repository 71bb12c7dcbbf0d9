//! Spawning, probing and terminating plugin server processes

use super::SupervisorError;
use crate::config::PluginServerDefinition;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Interval between socket connection attempts while a server starts.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Remove a leftover socket file. A missing file is fine.
pub fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

/// Whether the server currently accepts connections on its socket.
pub async fn probe(socket: &Path) -> bool {
    UnixStream::connect(socket).await.is_ok()
}

/// Launch `start_command` with the socket path appended and wait until the
/// socket accepts connections.
pub async fn spawn_and_wait(definition: &PluginServerDefinition) -> Result<Child, SupervisorError> {
    let spawn_failed = |reason: String| SupervisorError::SpawnFailed {
        server: definition.name.clone(),
        reason,
    };

    let (program, args) = definition
        .start_command
        .split_first()
        .ok_or_else(|| spawn_failed("start_command is empty".to_string()))?;

    remove_socket(&definition.socket);

    let mut child = Command::new(program)
        .args(args)
        .arg(&definition.socket)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_failed(format!("{}: {}", program, e)))?;

    debug!(plugin_server = %definition.name, pid = ?child.id(), "Spawned plugin server");

    let timeout = definition.restart.startup_timeout();
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().map_err(|e| spawn_failed(e.to_string()))? {
            return Err(spawn_failed(format!(
                "exited during startup ({})",
                describe_exit(&status)
            )));
        }
        if probe(&definition.socket).await {
            return Ok(child);
        }
        if Instant::now() >= deadline {
            let _ = child.kill().await;
            return Err(SupervisorError::StartupTimeout {
                server: definition.name.clone(),
                timeout,
            });
        }
        tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
    }
}

/// SIGTERM, then SIGKILL once `grace` has passed.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we own and have not reaped
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to wait for plugin server");
            None
        }
        Err(_) => {
            warn!(pid = ?child.id(), ?grace, "Plugin server ignored SIGTERM, killing");
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

pub fn describe_exit(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        _ => "unknown status".to_string(),
    }
}
