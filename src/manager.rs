//! Worker-level wiring of plugin servers
//!
//! For every configured server: query it, resolve its protocol, start it
//! under supervision, connect a client. Any of those steps failing takes out
//! that server only. The plugins a server describes are then handed to the
//! request runloop as [`ExternalPlugin`]s.

use crate::config::{PluginServerDefinition, PluginServersConfig, RestartPolicy};
use crate::context::{PhaseResult, RequestContext};
use crate::error::{Error, Result};
use crate::info::PluginInfo;
use crate::instance::InstanceRegistry;
use crate::pdk::PdkBridge;
use crate::phase::Phase;
use crate::protocol;
use crate::rpc::{ClientHooks, ClientOptions, RpcClient, RpcError};
use crate::supervisor::{self, ProcessState, ProcessStatus, SupervisorHandle};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A started, connected plugin server
pub struct PluginServer {
    definition: PluginServerDefinition,
    infos: Vec<PluginInfo>,
    supervisor: SupervisorHandle,
    client: Arc<dyn RpcClient>,
    reconnect_task: JoinHandle<()>,
}

impl PluginServer {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &PluginServerDefinition {
        &self.definition
    }

    pub fn infos(&self) -> &[PluginInfo] {
        &self.infos
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn client(&self) -> &Arc<dyn RpcClient> {
        &self.client
    }

    /// Handle for one plugin of this server bound to `config`
    pub fn plugin(&self, plugin_name: &str, config: JsonValue) -> Option<ExternalPlugin> {
        let info = self.infos.iter().find(|i| i.name == plugin_name)?.clone();
        Some(
            ExternalPlugin::new(self.client.clone(), info, config)
                .with_dispatch_timeout(self.definition.dispatch_timeout())
                .with_notification_phases(self.definition.notification_phases.clone()),
        )
    }

    async fn shutdown(&self) {
        self.reconnect_task.abort();
        self.client.close().await;
        self.supervisor.shutdown().await;
    }
}

/// How often a connected client is checked for a dropped transport
const CONNECTION_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Keep the client connected to whichever process the supervisor runs.
///
/// A new pid always reconnects. A transport that drops while the process
/// stays up is reconnected too, retrying with the restart backoff until a
/// connect succeeds.
async fn keep_connected(
    name: String,
    socket: PathBuf,
    policy: RestartPolicy,
    client: Arc<dyn RpcClient>,
    mut status: watch::Receiver<ProcessStatus>,
) {
    let mut connected_pid = status.borrow().pid;
    let mut attempt: u32 = 0;
    loop {
        let current = *status.borrow_and_update();
        if current.state.is_terminal() {
            client.close().await;
            break;
        }

        let restarted = current.state == ProcessState::Ready && current.pid.is_some() && current.pid != connected_pid;
        if client.is_connected() && !restarted {
            attempt = 0;
        } else if current.state.is_running() {
            attempt = attempt.saturating_add(1);
            match client.connect(&socket).await {
                Ok(()) => {
                    connected_pid = current.pid;
                    info!(plugin_server = %name, pid = ?current.pid, attempt, "Reconnected to plugin server");
                }
                Err(e) => warn!(plugin_server = %name, attempt, error = %e, "Reconnect failed"),
            }
        }

        let wait = if current.state.is_running() && !client.is_connected() {
            policy.backoff_for(attempt)
        } else {
            CONNECTION_CHECK_INTERVAL
        };
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!(plugin_server = %name, "Connection watcher finished");
}

/// All plugin servers of one worker.
pub struct PluginServerManager {
    pdk: PdkBridge,
    servers: BTreeMap<String, Arc<PluginServer>>,
}

impl PluginServerManager {
    /// `pdk` is the host's capability table, shared by every server.
    pub fn new(pdk: PdkBridge) -> Self {
        Self {
            pdk,
            servers: BTreeMap::new(),
        }
    }

    /// Query, resolve, start and connect one plugin server.
    pub async fn register(&mut self, definition: PluginServerDefinition) -> Result<Arc<PluginServer>> {
        definition.validate()?;
        if self.servers.contains_key(&definition.name) {
            return Err(Error::DuplicateServer(definition.name.clone()));
        }

        let infos = supervisor::query(&definition).await?;
        let protocol_id = definition
            .protocol
            .clone()
            .or_else(|| infos.iter().find_map(|i| i.protocol.clone()))
            .ok_or_else(|| Error::MissingProtocol {
                server: definition.name.clone(),
            })?;
        let factory = protocol::resolve(&protocol_id)?;

        let handle = supervisor::start(definition.clone()).await?;

        let hooks = ClientHooks::new(Arc::new(InstanceRegistry::new()), self.pdk.clone());
        let client = factory(hooks, ClientOptions::from_definition(&definition));
        if let Err(e) = client.connect(&definition.socket).await {
            handle.shutdown().await;
            return Err(e.into());
        }

        let reconnect_task = tokio::spawn(keep_connected(
            definition.name.clone(),
            definition.socket.clone(),
            definition.restart.clone(),
            client.clone(),
            handle.subscribe(),
        ));

        info!(
            plugin_server = %definition.name,
            protocol = %protocol_id,
            plugins = ?infos.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            "Plugin server registered"
        );

        let server = Arc::new(PluginServer {
            definition,
            infos,
            supervisor: handle,
            client,
            reconnect_task,
        });
        self.servers.insert(server.name().to_string(), server.clone());
        Ok(server)
    }

    /// Register every configured server. Failures are logged and returned;
    /// they never prevent the other servers from coming up.
    pub async fn register_all(&mut self, config: &PluginServersConfig) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for definition in &config.servers {
            let name = definition.name.clone();
            if let Err(e) = self.register(definition.clone()).await {
                error!(plugin_server = %name, error = %e, "Plugin server unavailable");
                failures.push((name, e));
            }
        }
        failures
    }

    pub fn server(&self, name: &str) -> Option<&Arc<PluginServer>> {
        self.servers.get(name)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Arc<PluginServer>> {
        self.servers.values()
    }

    /// Every plugin described by a registered server
    pub fn plugin_infos(&self) -> impl Iterator<Item = &PluginInfo> {
        self.servers.values().flat_map(|s| s.infos.iter())
    }

    /// Find the server hosting `plugin_name` and bind it to `config`.
    pub fn plugin(&self, plugin_name: &str, config: JsonValue) -> Option<ExternalPlugin> {
        self.servers
            .values()
            .find(|s| s.infos.iter().any(|i| i.name == plugin_name))
            .and_then(|s| s.plugin(plugin_name, config))
    }

    /// Close every client and stop every process.
    pub async fn shutdown(&mut self) {
        for (name, server) in std::mem::take(&mut self.servers) {
            server.shutdown().await;
            debug!(plugin_server = %name, "Plugin server shut down");
        }
    }
}

/// One configured plugin running in a plugin server, as the runloop sees it.
#[derive(Clone)]
pub struct ExternalPlugin {
    client: Arc<dyn RpcClient>,
    info: PluginInfo,
    config: JsonValue,
    dispatch_timeout: Duration,
    notification_phases: Vec<Phase>,
}

impl ExternalPlugin {
    pub fn new(client: Arc<dyn RpcClient>, info: PluginInfo, config: JsonValue) -> Self {
        Self {
            client,
            info,
            config,
            dispatch_timeout: Duration::from_secs(60),
            notification_phases: Vec::new(),
        }
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_notification_phases(mut self, phases: Vec<Phase>) -> Self {
        self.notification_phases = phases;
        self
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn priority(&self) -> i64 {
        self.info.priority
    }

    /// Run `phase` within the server's dispatch timeout, surfacing any failure.
    ///
    /// Phases the plugin did not declare are answered locally with a declined
    /// result. An unknown-instance reply resets the binding and is retried
    /// once with a fresh instance.
    pub async fn try_run_phase(
        &self,
        phase: Phase,
        context: &RequestContext,
    ) -> std::result::Result<PhaseResult, RpcError> {
        self.try_run_phase_within(phase, context, self.dispatch_timeout).await
    }

    /// Like [`try_run_phase`](Self::try_run_phase), bounded by `budget`.
    ///
    /// The budget covers the whole invocation: instance creation, the
    /// dispatch and the single unknown-instance retry. Running out of it
    /// anywhere yields `Timeout(budget)`.
    pub async fn try_run_phase_within(
        &self,
        phase: Phase,
        context: &RequestContext,
        budget: Duration,
    ) -> std::result::Result<PhaseResult, RpcError> {
        if !self.info.handles(phase) {
            return Ok(PhaseResult::declined());
        }

        let deadline = Instant::now() + budget;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut retried = false;
        loop {
            let instance = tokio::time::timeout(
                remaining(),
                self.client.get_or_create_instance(&self.info.name, &self.config),
            )
            .await
            .map_err(|_| RpcError::Timeout(budget))??;

            let left = remaining();
            if left.is_zero() {
                return Err(RpcError::Timeout(budget));
            }
            let outcome = if self.notification_phases.contains(&phase) {
                self.client
                    .notify(instance, phase, context.clone(), left)
                    .await
                    .map(|()| PhaseResult::declined())
            } else {
                self.client.dispatch(instance, phase, context.clone(), left).await
            };

            match outcome {
                Err(RpcError::InstanceNotFound(lost)) if !retried => {
                    warn!(plugin = %self.info.name, instance = %lost, %phase, "Plugin server lost the instance, recreating");
                    self.client.reset_instance(&self.info.name, &self.config).await;
                    retried = true;
                }
                Err(RpcError::Timeout(_)) => return Err(RpcError::Timeout(budget)),
                other => return other,
            }
        }
    }

    /// Run `phase`; any failure is logged and treated as "plugin declined".
    pub async fn run_phase(&self, phase: Phase, context: &RequestContext) -> PhaseResult {
        self.run_phase_within(phase, context, self.dispatch_timeout).await
    }

    /// Like [`run_phase`](Self::run_phase), bounded by `budget`.
    pub async fn run_phase_within(&self, phase: Phase, context: &RequestContext, budget: Duration) -> PhaseResult {
        match self.try_run_phase_within(phase, context, budget).await {
            Ok(result) => result,
            Err(e) => {
                warn!(plugin = %self.info.name, %phase, request_id = %context.request_id, error = %e, "Plugin phase failed, continuing without it");
                PhaseResult::declined()
            }
        }
    }
}
