//! Supervisor tests against the demo plugin server binary

use pluginserver::supervisor::{self, ProcessState};
use pluginserver::{Phase, PluginServerDefinition, RestartPolicy, CBOR_RPC_V1};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio_stream::StreamExt;

const WAIT: Duration = Duration::from_secs(10);

fn demo_bin() -> &'static str {
    env!("CARGO_BIN_EXE_demo-plugin-server")
}

fn definition(dir: &Path, restart: RestartPolicy) -> PluginServerDefinition {
    PluginServerDefinition::new("demo", dir.join("demo.sock"))
        .with_start_command(&[demo_bin(), "--protocol", CBOR_RPC_V1])
        .with_query_command(&[demo_bin(), "--dump", "--protocol", CBOR_RPC_V1])
        .with_restart(restart)
}

fn fast_restarts() -> RestartPolicy {
    RestartPolicy {
        initial_backoff_ms: 50,
        max_backoff_ms: 200,
        stop_grace_ms: 2_000,
        health_interval_ms: 0,
        ..RestartPolicy::default()
    }
}

fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[tokio::test]
async fn test_query_reports_plugin() {
    let temp = TempDir::new().unwrap();
    let infos = supervisor::query(&definition(temp.path(), fast_restarts())).await.unwrap();

    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "header-echo");
    assert_eq!(infos[0].phases, vec![Phase::Access, Phase::Log]);
    assert_eq!(infos[0].protocol.as_deref(), Some(CBOR_RPC_V1));
    // Query must not leave a server behind
    assert!(!temp.path().join("demo.sock").exists());
}

#[tokio::test]
async fn test_start_then_stop_removes_socket() {
    let temp = TempDir::new().unwrap();
    let def = definition(temp.path(), fast_restarts());

    let handle = supervisor::start(def.clone()).await.unwrap();
    let status = handle.status();
    assert_eq!(status.state, ProcessState::Ready);
    assert!(status.pid.is_some());
    assert!(def.socket.exists());

    handle.stop(Duration::from_secs(2)).await;
    assert_eq!(handle.state(), ProcessState::Stopped);
    assert!(!def.socket.exists());
}

#[tokio::test]
async fn test_crash_is_restarted() {
    let temp = TempDir::new().unwrap();
    let handle = supervisor::start(definition(temp.path(), fast_restarts())).await.unwrap();
    let mut exits = handle.monitor();
    let first_pid = handle.status().pid.unwrap();

    kill(first_pid);

    let event = tokio::time::timeout(WAIT, exits.next()).await.unwrap().unwrap();
    assert_eq!(event.server, "demo");
    assert_eq!(event.pid, Some(first_pid));
    assert_eq!(event.signal, Some(libc::SIGKILL));
    assert_eq!(event.state, ProcessState::Crashed);
    assert_eq!(event.restarts, 1);

    let mut status = handle.subscribe();
    let restarted = tokio::time::timeout(
        WAIT,
        status.wait_for(|s| s.state == ProcessState::Ready && s.pid.is_some() && s.pid != Some(first_pid)),
    )
    .await
    .unwrap()
    .map(|s| *s)
    .unwrap();
    assert_eq!(restarted.restarts, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_budget_fails() {
    let temp = TempDir::new().unwrap();
    let restart = RestartPolicy {
        max_restarts: 0,
        ..fast_restarts()
    };
    let def = definition(temp.path(), restart);
    let handle = supervisor::start(def.clone()).await.unwrap();

    kill(handle.status().pid.unwrap());

    let state = tokio::time::timeout(WAIT, handle.wait_for_state(|s| s.is_terminal()))
        .await
        .unwrap();
    assert_eq!(state, ProcessState::Failed);
    assert!(!def.socket.exists());
}

#[tokio::test]
async fn test_stop_during_backoff() {
    let temp = TempDir::new().unwrap();
    let restart = RestartPolicy {
        initial_backoff_ms: 60_000,
        ..fast_restarts()
    };
    let handle = supervisor::start(definition(temp.path(), restart)).await.unwrap();

    kill(handle.status().pid.unwrap());
    tokio::time::timeout(WAIT, handle.wait_for_state(|s| s == ProcessState::Crashed))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();
    assert_eq!(handle.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn test_stop_while_restart_is_starting() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("started-once");
    // First launch runs the demo server; every later launch never binds its socket
    let script = r#"if [ -e "$1" ]; then exec sleep 60; fi; touch "$1"; exec "$2" --protocol CborRpc:1 "$3""#;
    let marker_arg = marker.display().to_string();
    let def = PluginServerDefinition::new("demo", temp.path().join("demo.sock"))
        .with_start_command(&["sh", "-c", script, "sh", marker_arg.as_str(), demo_bin()])
        .with_query_command(&[demo_bin(), "--dump"])
        .with_restart(RestartPolicy {
            startup_timeout_ms: 60_000,
            ..fast_restarts()
        });

    let handle = supervisor::start(def.clone()).await.unwrap();
    assert!(marker.exists());

    kill(handle.status().pid.unwrap());
    let mut status = handle.subscribe();
    tokio::time::timeout(
        WAIT,
        status.wait_for(|s| s.state == ProcessState::Starting && s.restarts == 1),
    )
    .await
    .unwrap()
    .unwrap();

    // Must not wait out the startup timeout of the stuck attempt
    tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();
    assert_eq!(handle.state(), ProcessState::Stopped);
    assert!(!def.socket.exists());
}

#[tokio::test]
async fn test_missing_binary_fails_to_start() {
    let temp = TempDir::new().unwrap();
    let def = PluginServerDefinition::new("ghost", temp.path().join("ghost.sock"))
        .with_start_command(&["/nonexistent/plugin-server"])
        .with_query_command(&["/nonexistent/plugin-server", "--dump"]);

    assert!(matches!(
        supervisor::start(def.clone()).await,
        Err(supervisor::SupervisorError::SpawnFailed { .. })
    ));
    assert!(matches!(
        supervisor::query(&def).await,
        Err(supervisor::SupervisorError::QueryFailed { .. })
    ));
}
