//! Reading and writing `CborFrame:1` frames
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  4 bytes: u32 big-endian length                         │
//! ├─────────────────────────────────────────────────────────┤
//! │  N bytes: CBOR-encoded Frame                            │
//! └─────────────────────────────────────────────────────────┘
//! ```

use super::frame::{keys, Frame, FrameType, StreamId, PROTOCOL_VERSION};
use ciborium::Value;
use std::collections::BTreeMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MB) - hard limit to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during frame I/O
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CBOR encoding error: {0}")]
    Encode(String),

    #[error("CBOR decoding error: {0}")]
    Decode(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    /// Well-formed frame of a type this side does not know. The frame was
    /// consumed whole, so the connection stays in sync.
    #[error("Unknown frame type {frame_type} on stream {stream}")]
    UnknownFrameType { frame_type: u64, stream: StreamId },

    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

fn int(n: u64) -> Value {
    Value::Integer(n.into())
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            u64::try_from(n).ok()
        }
        _ => None,
    }
}

/// Encode a frame to CBOR bytes
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let mut map: Vec<(Value, Value)> = Vec::with_capacity(9);

    map.push((int(keys::VERSION), int(frame.version as u64)));
    map.push((int(keys::FRAME_TYPE), int(frame.frame_type as u8 as u64)));

    let stream = match &frame.stream {
        StreamId::Uuid(bytes) => Value::Bytes(bytes.to_vec()),
        StreamId::Uint(n) => int(*n),
    };
    map.push((int(keys::STREAM), stream));
    map.push((int(keys::SEQ), int(frame.seq)));

    if let Some(ref method) = frame.method {
        map.push((int(keys::METHOD), Value::Text(method.clone())));
    }
    if let Some(ref payload) = frame.payload {
        map.push((int(keys::PAYLOAD), payload.clone()));
    }
    if let Some(instance) = frame.instance {
        map.push((int(keys::INSTANCE), int(instance)));
    }
    if let Some(ref phase) = frame.phase {
        map.push((int(keys::PHASE), Value::Text(phase.clone())));
    }
    if let Some(ref message) = frame.message {
        map.push((int(keys::MESSAGE), Value::Text(message.clone())));
    }

    let mut buf = Vec::new();
    ciborium::into_writer(&Value::Map(map), &mut buf)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a frame from CBOR bytes, rejecting any version but 1
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| FrameError::Decode(e.to_string()))?;

    let map = match value {
        Value::Map(m) => m,
        _ => return Err(FrameError::InvalidFrame("expected map".to_string())),
    };

    let mut lookup: BTreeMap<u64, Value> = BTreeMap::new();
    for (k, v) in map {
        if let Some(key) = as_u64(&k) {
            lookup.insert(key, v);
        }
    }

    let version = lookup
        .get(&keys::VERSION)
        .and_then(as_u64)
        .ok_or_else(|| FrameError::InvalidFrame("missing version".to_string()))?;
    if version != PROTOCOL_VERSION as u64 {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let stream = match lookup.remove(&keys::STREAM) {
        Some(Value::Bytes(bytes)) if bytes.len() == 16 => {
            let mut arr = [0u8; 16];
            arr.copy_from_slice(&bytes);
            StreamId::Uuid(arr)
        }
        Some(other) => StreamId::Uint(
            as_u64(&other).ok_or_else(|| FrameError::InvalidFrame("invalid stream id".to_string()))?,
        ),
        None => return Err(FrameError::InvalidFrame("missing stream id".to_string())),
    };

    let frame_type = lookup
        .get(&keys::FRAME_TYPE)
        .and_then(as_u64)
        .ok_or_else(|| FrameError::InvalidFrame("missing frame_type".to_string()))?;
    let frame_type = u8::try_from(frame_type)
        .ok()
        .and_then(FrameType::from_u8)
        .ok_or_else(|| FrameError::UnknownFrameType {
            frame_type,
            stream: stream.clone(),
        })?;

    let text = |v: Value| match v {
        Value::Text(s) => Some(s),
        _ => None,
    };

    Ok(Frame {
        version: PROTOCOL_VERSION,
        frame_type,
        stream,
        seq: lookup.get(&keys::SEQ).and_then(as_u64).unwrap_or(0),
        method: lookup.remove(&keys::METHOD).and_then(text),
        payload: lookup.remove(&keys::PAYLOAD),
        instance: lookup.get(&keys::INSTANCE).and_then(as_u64),
        phase: lookup.remove(&keys::PHASE).and_then(text),
        message: lookup.remove(&keys::MESSAGE).and_then(text),
    })
}

/// Write a length-prefixed CBOR frame to an async writer
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let bytes = encode_frame(frame)?;

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed CBOR frame from an async reader
///
/// Returns Ok(None) on clean EOF, Err(UnexpectedEof) on partial read.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FrameError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; length];
    if let Err(e) = reader.read_exact(&mut payload).await {
        return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::UnexpectedEof
        } else {
            FrameError::Io(e)
        });
    }

    decode_frame(&payload).map(Some)
}

/// Async frame reader
pub struct FrameReader<R: AsyncRead + Unpin> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame
    pub async fn read(&mut self) -> Result<Option<Frame>, FrameError> {
        read_frame_async(&mut self.reader).await
    }
}

/// Async frame writer
pub struct FrameWriter<W: AsyncWrite + Unpin> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a frame
    pub async fn write(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame_async(&mut self.writer, frame).await
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
