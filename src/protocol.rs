//! Protocol Registry
//!
//! Maps a protocol identifier to the factory of the matching RPC client.
//! The table is static: exactly two wire protocols exist.

use crate::rpc::framed::FramedClient;
use crate::rpc::legacy::LegacyClient;
use crate::rpc::{ClientHooks, ClientOptions, RpcClient};
use std::sync::Arc;

/// Legacy bidirectional CBOR-RPC
pub const CBOR_RPC_V1: &str = "CborRpc:1";
/// Structured, versioned CBOR frames
pub const CBOR_FRAME_V1: &str = "CborFrame:1";

/// Builds a client; the hooks are handed over opaque.
pub type RpcClientFactory = fn(ClientHooks, ClientOptions) -> Arc<dyn RpcClient>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown plugin server protocol: {0}")]
    UnknownProtocol(String),
}

fn legacy(hooks: ClientHooks, options: ClientOptions) -> Arc<dyn RpcClient> {
    Arc::new(LegacyClient::new(hooks, options))
}

fn framed(hooks: ClientHooks, options: ClientOptions) -> Arc<dyn RpcClient> {
    Arc::new(FramedClient::new(hooks, options))
}

const PROTOCOLS: &[(&str, RpcClientFactory)] = &[(CBOR_RPC_V1, legacy), (CBOR_FRAME_V1, framed)];

/// Resolve a protocol identifier to its client factory.
pub fn resolve(protocol_id: &str) -> Result<RpcClientFactory, ProtocolError> {
    PROTOCOLS
        .iter()
        .find(|(id, _)| *id == protocol_id)
        .map(|(_, factory)| *factory)
        .ok_or_else(|| ProtocolError::UnknownProtocol(protocol_id.to_string()))
}

/// Every protocol identifier this build understands.
pub fn supported() -> impl Iterator<Item = &'static str> {
    PROTOCOLS.iter().map(|(id, _)| *id)
}
