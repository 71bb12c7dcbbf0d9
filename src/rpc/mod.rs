//! RPC clients for plugin servers
//!
//! Two wire protocols, one contract. The rest of the gateway only ever sees
//! `Arc<dyn RpcClient>`, chosen by the [protocol registry](crate::protocol).
//!
//! - [`legacy`]: bidirectional CBOR-RPC (calls + notifications, numeric
//!   correlation ids, self-delimiting CBOR values on the stream)
//! - [`framed`]: versioned, length-prefixed CBOR frames with one logical
//!   stream per invocation
//!
//! ## Failure policy
//!
//! A transport disconnect fails every outstanding dispatch with
//! [`RpcError::ConnectionLost`] immediately. Clients never reconnect on their
//! own; the owner calls [`RpcClient::connect`] again, either for a process
//! the supervisor restarted or for one still running whose transport dropped.

pub mod framed;
pub mod legacy;
pub mod value;

use crate::config::PluginServerDefinition;
use crate::context::{PhaseResult, RequestContext};
use crate::instance::{ConfigFingerprint, InstanceId, InstanceRegistry};
use crate::pdk::PdkBridge;
use crate::phase::Phase;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by an RPC client
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("Failed to connect to {socket}: {reason}")]
    ConnectFailed { socket: String, reason: String },

    #[error("Connection to plugin server lost")]
    ConnectionLost,

    #[error("Failed to create instance of plugin '{plugin}': {reason}")]
    InstantiationFailed { plugin: String, reason: String },

    #[error("Plugin returned error: {0}")]
    RemoteError(String),

    #[error("Plugin server does not know instance {0}")]
    InstanceNotFound(InstanceId),

    #[error("Phase dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl RpcError {
    /// Whether the transport is gone and the process should be looked at.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, RpcError::ConnectFailed { .. } | RpcError::ConnectionLost)
    }
}

/// Collaborators wired into a client at construction.
///
/// Both are owned by the plugin-loading layer; clients use them but never
/// inspect or extend them.
#[derive(Debug, Clone)]
pub struct ClientHooks {
    /// Instance-id resolution and reset
    pub instances: Arc<InstanceRegistry>,
    /// Capabilities the remote side may call mid-phase
    pub pdk: PdkBridge,
}

impl ClientHooks {
    pub fn new(instances: Arc<InstanceRegistry>, pdk: PdkBridge) -> Self {
        Self { instances, pdk }
    }
}

/// Message prefix plugin servers use to report an unknown instance id.
pub const INSTANCE_NOT_FOUND: &str = "no plugin instance";

/// Per-server client tuning taken from the definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Deadline for control calls (instance creation and close)
    pub request_timeout: Duration,
    /// Phases sent as fire-and-forget notifications where the protocol allows
    pub notification_phases: Vec<Phase>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            notification_phases: Vec::new(),
        }
    }
}

impl ClientOptions {
    pub fn from_definition(definition: &PluginServerDefinition) -> Self {
        Self {
            request_timeout: definition.dispatch_timeout(),
            notification_phases: definition.notification_phases.clone(),
        }
    }
}

/// Abstract contract every wire protocol implements.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Protocol identifier this client speaks
    fn protocol(&self) -> &'static str;

    /// Establish the transport. Safe to call again after a disconnect; a new
    /// connection starts with an empty instance table.
    async fn connect(&self, socket: &Path) -> Result<(), RpcError>;

    fn is_connected(&self) -> bool;

    /// Resolve (or remotely create) the instance for this configuration.
    async fn get_or_create_instance(
        &self,
        plugin_name: &str,
        config: &JsonValue,
    ) -> Result<InstanceId, RpcError>;

    /// Run one phase on an instance, serving PDK calls until the remote side
    /// reports completion, an error, or `timeout` elapses.
    async fn dispatch(
        &self,
        instance: InstanceId,
        phase: Phase,
        context: RequestContext,
        timeout: Duration,
    ) -> Result<PhaseResult, RpcError>;

    /// Fire-and-forget variant for phases whose outcome is not awaited.
    /// Protocols without notifications dispatch and discard the result.
    async fn notify(
        &self,
        instance: InstanceId,
        phase: Phase,
        context: RequestContext,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        self.dispatch(instance, phase, context, timeout).await.map(|_| ())
    }

    /// Forget the instance bound to this configuration.
    async fn reset_instance(&self, plugin_name: &str, config: &JsonValue);

    /// Release the transport and fail all pending calls with `ConnectionLost`.
    async fn close(&self);
}

/// Shared `reset_instance` behaviour: drop the local binding.
pub(crate) fn forget_instance(
    hooks: &ClientHooks,
    protocol: &str,
    plugin_name: &str,
    config: &JsonValue,
) -> Option<InstanceId> {
    let fingerprint = ConfigFingerprint::of(config);
    let dropped = hooks.instances.invalidate(plugin_name, &fingerprint);
    if let Some(id) = dropped {
        tracing::info!(protocol, plugin = plugin_name, instance = %id, config = %fingerprint, "Instance reset");
    }
    dropped
}

/// Classify an error message returned by the plugin server for `instance`.
pub(crate) fn remote_failure(message: String, instance: InstanceId) -> RpcError {
    if message.starts_with(INSTANCE_NOT_FOUND) {
        RpcError::InstanceNotFound(instance)
    } else {
        RpcError::RemoteError(message)
    }
}
