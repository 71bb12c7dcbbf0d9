//! Plugin server bridge - runs gateway plugins in external processes
//!
//! A gateway worker hands request phases to plugins that live in separate
//! plugin server processes, reached over a Unix socket. This library starts
//! and supervises those processes, speaks their wire protocols, binds plugin
//! configurations to remote instances, and serves the gateway capabilities
//! (the PDK) that plugins call back into while a phase runs.

pub mod config;
pub mod context;
pub mod error;
pub mod info;
pub mod instance;
pub mod manager;
pub mod pdk;
pub mod phase;
pub mod protocol;
pub mod rpc;
pub mod supervisor;

pub use config::{PluginServerDefinition, PluginServersConfig, RestartPolicy};
pub use context::{ExitResponse, HeaderMutation, PhaseResult, PipelineControl, RequestContext};
pub use error::{Error, Result};
pub use info::PluginInfo;
pub use instance::{ConfigFingerprint, InstanceId, InstanceRegistry};
pub use manager::{ExternalPlugin, PluginServer, PluginServerManager};
pub use pdk::{PdkBridge, PdkContext};
pub use phase::Phase;
pub use protocol::{CBOR_FRAME_V1, CBOR_RPC_V1};
pub use rpc::{ClientHooks, ClientOptions, RpcClient, RpcError};
pub use supervisor::{ProcessExitEvent, ProcessState, ProcessStatus, SupervisorHandle};
