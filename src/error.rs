//! Crate-wide error type

use crate::config::ConfigError;
use crate::pdk::PdkError;
use crate::protocol::ProtocolError;
use crate::rpc::RpcError;
use crate::supervisor::SupervisorError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Pdk(#[from] PdkError),

    #[error("Plugin server '{server}' names no protocol and its query reported none")]
    MissingProtocol { server: String },

    #[error("Plugin server '{0}' is already registered")]
    DuplicateServer(String),
}

pub type Result<T> = std::result::Result<T, Error>;
