//! Frame types for the `CborFrame:1` protocol
//!
//! Every frame is a CBOR map with integer keys:
//! ```text
//! {
//!   0: version (u8, always 1)
//!   1: frame_type (u8)
//!   2: stream (bytes[16] or uint)
//!   3: seq (u64, PDK call number within a stream)
//!   4: method (tstr, optional)
//!   5: payload (any, optional)
//!   6: instance (u64, optional)
//!   7: phase (tstr, optional)
//!   8: message (tstr, optional - error text)
//! }
//! ```
//!
//! ## Frame Types
//!
//! - CREATE_INSTANCE (0) / INSTANCE_CREATED (1)
//! - START_PHASE (2): run a phase; the stream stays open until PHASE_RESULT
//! - PDK_CALL (3) / PDK_RESULT (4): plugin-to-gateway calls inside a phase
//! - PHASE_RESULT (5): phase complete
//! - ERROR (6): the stream failed
//! - CLOSE_INSTANCE (7) / INSTANCE_CLOSED (8)

use ciborium::Value;
use std::fmt;

/// Protocol version. Frames carrying anything else are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    CreateInstance = 0,
    InstanceCreated = 1,
    StartPhase = 2,
    PdkCall = 3,
    PdkResult = 4,
    PhaseResult = 5,
    Error = 6,
    CloseInstance = 7,
    InstanceClosed = 8,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameType::CreateInstance),
            1 => Some(FrameType::InstanceCreated),
            2 => Some(FrameType::StartPhase),
            3 => Some(FrameType::PdkCall),
            4 => Some(FrameType::PdkResult),
            5 => Some(FrameType::PhaseResult),
            6 => Some(FrameType::Error),
            7 => Some(FrameType::CloseInstance),
            8 => Some(FrameType::InstanceClosed),
            _ => None,
        }
    }
}

/// Logical stream id - either a 16-byte UUID or a simple integer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamId {
    Uuid([u8; 16]),
    Uint(u64),
}

impl StreamId {
    /// Create a new random UUID stream id
    pub fn new_uuid() -> Self {
        StreamId::Uuid(*uuid::Uuid::new_v4().as_bytes())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        StreamId::new_uuid()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Uuid(bytes) => write!(f, "{}", uuid::Uuid::from_bytes(*bytes)),
            StreamId::Uint(n) => write!(f, "{}", n),
        }
    }
}

/// A `CborFrame:1` protocol frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub frame_type: FrameType,
    pub stream: StreamId,
    pub seq: u64,
    pub method: Option<String>,
    pub payload: Option<Value>,
    pub instance: Option<u64>,
    pub phase: Option<String>,
    pub message: Option<String>,
}

impl Frame {
    pub fn new(frame_type: FrameType, stream: StreamId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            stream,
            seq: 0,
            method: None,
            payload: None,
            instance: None,
            phase: None,
            message: None,
        }
    }

    /// Ask for an instance of plugin `name` with `config`
    pub fn create_instance(stream: StreamId, name: &str, config: Value) -> Self {
        let mut frame = Self::new(FrameType::CreateInstance, stream);
        frame.method = Some(name.to_string());
        frame.payload = Some(config);
        frame
    }

    pub fn instance_created(stream: StreamId, instance: u64) -> Self {
        let mut frame = Self::new(FrameType::InstanceCreated, stream);
        frame.instance = Some(instance);
        frame
    }

    pub fn start_phase(stream: StreamId, instance: u64, phase: &str, context: Value) -> Self {
        let mut frame = Self::new(FrameType::StartPhase, stream);
        frame.instance = Some(instance);
        frame.phase = Some(phase.to_string());
        frame.payload = Some(context);
        frame
    }

    /// PDK call `seq` with positional `args` (a CBOR array)
    pub fn pdk_call(stream: StreamId, seq: u64, method: &str, args: Value) -> Self {
        let mut frame = Self::new(FrameType::PdkCall, stream);
        frame.seq = seq;
        frame.method = Some(method.to_string());
        frame.payload = Some(args);
        frame
    }

    /// Answer PDK call `seq`; an error travels in `message`
    pub fn pdk_result(stream: StreamId, seq: u64, result: Result<Value, String>) -> Self {
        let mut frame = Self::new(FrameType::PdkResult, stream);
        frame.seq = seq;
        match result {
            Ok(value) => frame.payload = Some(value),
            Err(message) => frame.message = Some(message),
        }
        frame
    }

    pub fn phase_result(stream: StreamId) -> Self {
        Self::new(FrameType::PhaseResult, stream)
    }

    pub fn error(stream: StreamId, message: &str) -> Self {
        let mut frame = Self::new(FrameType::Error, stream);
        frame.message = Some(message.to_string());
        frame
    }

    pub fn close_instance(stream: StreamId, instance: u64) -> Self {
        let mut frame = Self::new(FrameType::CloseInstance, stream);
        frame.instance = Some(instance);
        frame
    }

    pub fn instance_closed(stream: StreamId) -> Self {
        Self::new(FrameType::InstanceClosed, stream)
    }

    /// Error text for ERROR and failed PDK_RESULT frames
    pub fn error_message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Integer keys for frame fields
pub mod keys {
    pub const VERSION: u64 = 0;
    pub const FRAME_TYPE: u64 = 1;
    pub const STREAM: u64 = 2;
    pub const SEQ: u64 = 3;
    pub const METHOD: u64 = 4;
    pub const PAYLOAD: u64 = 5;
    pub const INSTANCE: u64 = 6;
    pub const PHASE: u64 = 7;
    pub const MESSAGE: u64 = 8;
}
