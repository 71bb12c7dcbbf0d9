//! `CborRpc:1`: the legacy bidirectional protocol
//!
//! Calls in both directions plus notifications, correlated by numeric
//! message ids, over a stream of self-delimiting CBOR values.

pub mod client;
pub mod codec;

pub use client::LegacyClient;
pub use codec::{CodecError, Message, MessageReader, MessageWriter};
