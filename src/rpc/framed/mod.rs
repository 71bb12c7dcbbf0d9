//! `CborFrame:1`: the structured, versioned frame protocol
//!
//! Length-prefixed CBOR frames with an explicit version field and one
//! logical stream per invocation. There are no notifications.

pub mod client;
pub mod frame;
pub mod io;

pub use client::FramedClient;
pub use frame::{Frame, FrameType, StreamId, PROTOCOL_VERSION};
pub use io::{FrameError, FrameReader, FrameWriter};
