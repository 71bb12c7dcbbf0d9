//! End-to-end tests: manager, both wire protocols, demo plugin server

use pluginserver::pdk::builtin;
use pluginserver::rpc::framed::FramedClient;
use pluginserver::rpc::legacy::LegacyClient;
use pluginserver::supervisor::{self, ProcessState};
use pluginserver::{
    ClientHooks, ClientOptions, Error, HeaderMutation, InstanceRegistry, PdkBridge, Phase, PhaseResult,
    PipelineControl, PluginServerDefinition, PluginServerManager, PluginServersConfig, RequestContext,
    RestartPolicy, RpcClient, RpcError, CBOR_FRAME_V1, CBOR_RPC_V1,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn demo_bin() -> &'static str {
    env!("CARGO_BIN_EXE_demo-plugin-server")
}

fn definition(dir: &Path, name: &str, protocol: &str) -> PluginServerDefinition {
    PluginServerDefinition::new(name, dir.join(format!("{}.sock", name)))
        .with_start_command(&[demo_bin(), "--protocol", protocol])
        .with_query_command(&[demo_bin(), "--dump", "--protocol", protocol])
        .with_restart(RestartPolicy {
            initial_backoff_ms: 50,
            max_backoff_ms: 200,
            stop_grace_ms: 2_000,
            health_interval_ms: 0,
            ..RestartPolicy::default()
        })
}

fn bridge() -> PdkBridge {
    PdkBridge::new(builtin::capabilities())
}

fn hooks() -> ClientHooks {
    ClientHooks::new(Arc::new(InstanceRegistry::new()), bridge())
}

fn echoed(value: &str) -> Vec<HeaderMutation> {
    vec![HeaderMutation::Set {
        name: "x-echoed".to_string(),
        value: value.to_string(),
    }]
}

async fn access_roundtrip(protocol: &str) {
    let temp = TempDir::new().unwrap();
    let mut manager = PluginServerManager::new(bridge());
    manager
        .register(definition(temp.path(), "demo", protocol))
        .await
        .unwrap();

    let plugin = manager.plugin("header-echo", json!({})).unwrap();
    assert_eq!(plugin.priority(), 1000);

    let ctx = RequestContext::new("GET", "/items").with_header("X-Echo", "hello");
    let result = plugin.try_run_phase(Phase::Access, &ctx).await.unwrap();
    assert_eq!(result.upstream_headers, echoed("hello"));
    assert_eq!(result.control(), PipelineControl::Continue);

    let ctx = RequestContext::new("GET", "/items").with_header("x-deny", "1");
    let result = plugin.try_run_phase(Phase::Access, &ctx).await.unwrap();
    let exit = result.exit.clone().unwrap();
    assert_eq!(exit.status, 403);
    assert_eq!(result.control(), PipelineControl::Terminate);

    // Log only logs
    let result = plugin.try_run_phase(Phase::Log, &ctx).await.unwrap();
    assert!(result.is_empty());

    // Declared as access+log only
    let result = plugin.try_run_phase(Phase::HeaderFilter, &ctx).await.unwrap();
    assert_eq!(result, PhaseResult::declined());

    manager.shutdown().await;
    assert!(!temp.path().join("demo.sock").exists());
}

#[tokio::test]
async fn test_access_phase_over_cbor_rpc() {
    access_roundtrip(CBOR_RPC_V1).await;
}

#[tokio::test]
async fn test_access_phase_over_cbor_frame() {
    access_roundtrip(CBOR_FRAME_V1).await;
}

#[tokio::test]
async fn test_config_selects_instance() {
    let temp = TempDir::new().unwrap();
    let mut manager = PluginServerManager::new(bridge());
    manager
        .register(definition(temp.path(), "demo", CBOR_FRAME_V1))
        .await
        .unwrap();

    let default = manager.plugin("header-echo", json!({})).unwrap();
    let custom = manager.plugin("header-echo", json!({ "header": "x-custom" })).unwrap();
    let ctx = RequestContext::new("GET", "/").with_header("x-echo", "v");

    let a = default.run_phase(Phase::Access, &ctx).await;
    let b = custom.run_phase(Phase::Access, &ctx).await;
    assert_eq!(a.upstream_headers, echoed("v"));
    assert_eq!(
        b.upstream_headers,
        vec![HeaderMutation::Set {
            name: "x-custom".to_string(),
            value: "v".to_string(),
        }]
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unknown_protocol_isolated_to_its_server() {
    let temp = TempDir::new().unwrap();
    let config = PluginServersConfig {
        servers: vec![
            definition(temp.path(), "odd", CBOR_RPC_V1).with_protocol("Foo:1"),
            definition(temp.path(), "good", CBOR_RPC_V1),
        ],
    };

    let mut manager = PluginServerManager::new(bridge());
    let failures = manager.register_all(&config).await;

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "odd");
    assert!(matches!(failures[0].1, Error::Protocol(_)));
    assert!(manager.server("odd").is_none());
    assert!(manager.server("good").is_some());
    // Never started
    assert!(!temp.path().join("odd.sock").exists());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_client_reconnects_after_crash() {
    let temp = TempDir::new().unwrap();
    let mut manager = PluginServerManager::new(bridge());
    let server = manager
        .register(definition(temp.path(), "demo", CBOR_RPC_V1))
        .await
        .unwrap();
    let plugin = manager.plugin("header-echo", json!({})).unwrap();
    let ctx = RequestContext::new("GET", "/").with_header("x-echo", "again");

    plugin.try_run_phase(Phase::Access, &ctx).await.unwrap();

    let first_pid = server.supervisor().status().pid.unwrap();
    unsafe {
        libc::kill(first_pid as libc::pid_t, libc::SIGKILL);
    }

    let mut status = server.supervisor().subscribe();
    tokio::time::timeout(
        WAIT,
        status.wait_for(|s| s.state == ProcessState::Ready && s.pid.is_some() && s.pid != Some(first_pid)),
    )
    .await
    .unwrap()
    .unwrap();

    // The reconnect happens just after the new process reports ready
    let mut result = plugin.try_run_phase(Phase::Access, &ctx).await;
    for _ in 0..50 {
        if result.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        result = plugin.try_run_phase(Phase::Access, &ctx).await;
    }
    assert_eq!(result.unwrap().upstream_headers, echoed("again"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_client_reconnects_when_connection_drops() {
    let temp = TempDir::new().unwrap();
    let mut manager = PluginServerManager::new(bridge());
    let server = manager
        .register(definition(temp.path(), "demo", CBOR_FRAME_V1))
        .await
        .unwrap();
    let plugin = manager.plugin("header-echo", json!({})).unwrap();
    let ctx = RequestContext::new("GET", "/").with_header("x-echo", "still-here");
    plugin.try_run_phase(Phase::Access, &ctx).await.unwrap();

    let pid = server.supervisor().status().pid;
    server.client().close().await;
    assert!(!server.client().is_connected());

    for _ in 0..50 {
        if server.client().is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(server.client().is_connected());
    // Same process, no restart involved
    assert_eq!(server.supervisor().status().pid, pid);

    let result = plugin.try_run_phase(Phase::Access, &ctx).await.unwrap();
    assert_eq!(result.upstream_headers, echoed("still-here"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_closed_instance_reports_not_found_cbor_rpc() {
    let temp = TempDir::new().unwrap();
    let def = definition(temp.path(), "demo", CBOR_RPC_V1);
    let handle = supervisor::start(def.clone()).await.unwrap();

    let client = LegacyClient::new(hooks(), ClientOptions::default());
    client.connect(&def.socket).await.unwrap();
    let id = client.get_or_create_instance("header-echo", &json!({})).await.unwrap();
    client.close_instance(id).await.unwrap();

    let err = client
        .dispatch(id, Phase::Access, RequestContext::default(), WAIT)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::InstanceNotFound(id));

    client.close().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_closed_instance_reports_not_found_cbor_frame() {
    let temp = TempDir::new().unwrap();
    let def = definition(temp.path(), "demo", CBOR_FRAME_V1);
    let handle = supervisor::start(def.clone()).await.unwrap();

    let client = FramedClient::new(hooks(), ClientOptions::default());
    client.connect(&def.socket).await.unwrap();
    let id = client.get_or_create_instance("header-echo", &json!({})).await.unwrap();
    client.close_instance(id).await.unwrap();

    let err = client
        .dispatch(id, Phase::Access, RequestContext::default(), WAIT)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::InstanceNotFound(id));

    client.close().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_plugin_fails_instantiation() {
    let temp = TempDir::new().unwrap();
    let def = definition(temp.path(), "demo", CBOR_FRAME_V1);
    let handle = supervisor::start(def.clone()).await.unwrap();

    let client = FramedClient::new(hooks(), ClientOptions::default());
    client.connect(&def.socket).await.unwrap();
    let err = client
        .get_or_create_instance("no-such-plugin", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InstantiationFailed { .. }));

    client.close().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_slow_phase_times_out_without_poisoning_connection() {
    let temp = TempDir::new().unwrap();
    let mut def = definition(temp.path(), "demo", CBOR_RPC_V1);
    def.dispatch_timeout_ms = 200;

    let mut manager = PluginServerManager::new(bridge());
    manager.register(def).await.unwrap();

    let slow = manager.plugin("header-echo", json!({ "delay_ms": 2_000 })).unwrap();
    let fast = manager.plugin("header-echo", json!({})).unwrap();
    let ctx = RequestContext::new("GET", "/").with_header("x-echo", "quick");

    let err = slow.try_run_phase(Phase::Access, &ctx).await.unwrap_err();
    assert_eq!(err, RpcError::Timeout(Duration::from_millis(200)));

    let result = fast.try_run_phase(Phase::Access, &ctx).await.unwrap();
    assert_eq!(result.upstream_headers, echoed("quick"));

    manager.shutdown().await;
}
