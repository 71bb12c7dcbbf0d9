//! CBOR-RPC message codec
//!
//! Messages are written back to back as self-delimiting CBOR values. There is
//! no length prefix: the decoder buffers bytes until one complete value is
//! available.
//!
//! ## Message shapes
//!
//! ```text
//! request       [0, msgid, method, params]
//! response      [1, msgid, error, result]
//! notification  [2, method, params]
//! ```
//!
//! `error` is `null` on success. Requests flow in both directions: the
//! gateway calls `plugin.*` methods, the plugin server calls PDK methods.

use ciborium::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::rpc::value::as_u64;

pub const KIND_REQUEST: u64 = 0;
pub const KIND_RESPONSE: u64 = 1;
pub const KIND_NOTIFICATION: u64 = 2;

/// Largest message accepted from the peer (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Errors that can occur during CBOR-RPC I/O
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CBOR encoding error: {0}")]
    Encode(String),

    #[error("CBOR decoding error: {0}")]
    Decode(String),

    #[error("Message too large: more than {max} bytes buffered")]
    MessageTooLarge { max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// One CBOR-RPC message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        msgid: u32,
        method: String,
        params: Value,
    },
    Response {
        msgid: u32,
        error: Option<Value>,
        result: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Message {
    pub fn request(msgid: u32, method: &str, params: Value) -> Self {
        Message::Request {
            msgid,
            method: method.to_string(),
            params,
        }
    }

    pub fn ok(msgid: u32, result: Value) -> Self {
        Message::Response {
            msgid,
            error: None,
            result,
        }
    }

    pub fn err(msgid: u32, message: &str) -> Self {
        Message::Response {
            msgid,
            error: Some(Value::Text(message.to_string())),
            result: Value::Null,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Message::Notification {
            method: method.to_string(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { msgid, method, params } => Value::Array(vec![
                Value::Integer(KIND_REQUEST.into()),
                Value::Integer((*msgid).into()),
                Value::Text(method.clone()),
                params.clone(),
            ]),
            Message::Response { msgid, error, result } => Value::Array(vec![
                Value::Integer(KIND_RESPONSE.into()),
                Value::Integer((*msgid).into()),
                error.clone().unwrap_or(Value::Null),
                result.clone(),
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::Integer(KIND_NOTIFICATION.into()),
                Value::Text(method.clone()),
                params.clone(),
            ]),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let items = match value {
            Value::Array(items) => items,
            _ => return Err(CodecError::InvalidMessage("expected array".to_string())),
        };
        let mut items = items.into_iter();
        let kind = items
            .next()
            .as_ref()
            .and_then(as_u64)
            .ok_or_else(|| CodecError::InvalidMessage("missing message kind".to_string()))?;

        match kind {
            KIND_REQUEST => {
                let msgid = take_msgid(items.next())?;
                let method = take_method(items.next())?;
                let params = items.next().unwrap_or(Value::Null);
                Ok(Message::Request { msgid, method, params })
            }
            KIND_RESPONSE => {
                let msgid = take_msgid(items.next())?;
                let error = match items.next() {
                    None | Some(Value::Null) => None,
                    Some(e) => Some(e),
                };
                let result = items.next().unwrap_or(Value::Null);
                Ok(Message::Response { msgid, error, result })
            }
            KIND_NOTIFICATION => {
                let method = take_method(items.next())?;
                let params = items.next().unwrap_or(Value::Null);
                Ok(Message::Notification { method, params })
            }
            other => Err(CodecError::InvalidMessage(format!(
                "unknown message kind: {}",
                other
            ))),
        }
    }
}

fn take_msgid(value: Option<Value>) -> Result<u32, CodecError> {
    value
        .as_ref()
        .and_then(as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| CodecError::InvalidMessage("invalid msgid".to_string()))
}

fn take_method(value: Option<Value>) -> Result<String, CodecError> {
    match value {
        Some(Value::Text(s)) => Ok(s),
        _ => Err(CodecError::InvalidMessage("invalid method name".to_string())),
    }
}

/// Encode a message to CBOR bytes
pub fn encode_message(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(&message.to_value(), &mut buf)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Resumable walk over CBOR item heads.
///
/// Finds where the first complete value in a buffer ends without building
/// it. Progress is kept between calls, so every byte is looked at once no
/// matter how many reads a large value arrives in.
#[derive(Debug, Default)]
struct ValueScanner {
    pos: usize,
    /// Items still owed by each open container; `None` until a break byte
    open: Vec<Option<u64>>,
}

impl ValueScanner {
    /// End offset of the first value once all of it is in `buf`.
    fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        loop {
            let Some(&initial) = buf.get(self.pos) else {
                return Ok(None);
            };
            let major = initial >> 5;
            let info = initial & 0x1f;

            if initial == 0xff {
                match self.open.last() {
                    Some(None) => {
                        self.open.pop();
                        self.pos += 1;
                    }
                    _ => return Err(CodecError::Decode("unexpected break".to_string())),
                }
            } else {
                let extra = match info {
                    0..=23 | 31 => 0,
                    24 => 1,
                    25 => 2,
                    26 => 4,
                    27 => 8,
                    _ => return Err(CodecError::Decode(format!("reserved additional info {}", info))),
                };
                let body = self.pos + 1;
                let Some(arg_bytes) = buf.get(body..body + extra) else {
                    return Ok(None);
                };
                let arg = if info < 24 {
                    u64::from(info)
                } else {
                    arg_bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
                };
                let indefinite = info == 31;

                match (major, indefinite) {
                    (2 | 3, false) => {
                        let end = usize::try_from(arg)
                            .ok()
                            .and_then(|len| (body + extra).checked_add(len))
                            .filter(|end| *end <= MAX_MESSAGE_SIZE)
                            .ok_or(CodecError::MessageTooLarge {
                                max: MAX_MESSAGE_SIZE,
                            })?;
                        if buf.len() < end {
                            return Ok(None);
                        }
                        self.pos = end;
                    }
                    (2..=5, true) => {
                        self.pos = body;
                        self.open.push(None);
                        continue;
                    }
                    (4 | 5, false) => {
                        self.pos = body + extra;
                        let items = if major == 5 { arg.saturating_mul(2) } else { arg };
                        if items > 0 {
                            self.open.push(Some(items));
                            continue;
                        }
                    }
                    // A tag wraps the item that follows
                    (6, false) => {
                        self.pos = body + extra;
                        continue;
                    }
                    (0 | 1 | 7, false) => self.pos = body + extra,
                    _ => return Err(CodecError::Decode(format!("invalid indefinite length for major type {}", major))),
                }
            }

            // One item finished; close every container it completes
            loop {
                match self.open.last_mut() {
                    None => return Ok(Some(self.pos)),
                    Some(Some(owed)) => {
                        *owed -= 1;
                        if *owed > 0 {
                            break;
                        }
                        self.open.pop();
                    }
                    Some(None) => break,
                }
            }
        }
    }
}

/// Incremental decoder for a stream of CBOR values
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
    scanner: ValueScanner,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete message, or `None` if more bytes are needed.
    ///
    /// Bytes are only parsed into a value once the whole value has arrived.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        let Some(end) = self.scanner.advance(&self.buf)? else {
            if self.buf.len() > MAX_MESSAGE_SIZE {
                return Err(CodecError::MessageTooLarge {
                    max: MAX_MESSAGE_SIZE,
                });
            }
            return Ok(None);
        };
        self.scanner = ValueScanner::default();

        let value = ciborium::from_reader::<Value, _>(&self.buf[..end])
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        self.buf.drain(..end);
        Message::from_value(value).map(Some)
    }
}

/// Reads messages from an async byte stream
pub struct MessageReader<R> {
    reader: R,
    decoder: MessageDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: MessageDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Read the next message.
    ///
    /// Returns Ok(None) on clean EOF, Err(UnexpectedEof) if the stream ends
    /// inside a message.
    pub async fn read(&mut self) -> Result<Option<Message>, CodecError> {
        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(Some(message));
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                return if self.decoder.buffered() == 0 {
                    Ok(None)
                } else {
                    Err(CodecError::UnexpectedEof)
                };
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

/// Writes messages to an async byte stream
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write(&mut self, message: &Message) -> Result<(), CodecError> {
        let bytes = encode_message(message)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Value {
        Value::Map(vec![(Value::Text("id".to_string()), Value::Integer(3.into()))])
    }

    #[test]
    fn test_message_shapes() {
        let req = Message::request(7, "plugin.new_instance", params()).to_value();
        match req {
            Value::Array(items) => {
                assert_eq!(items.len(), 4);
                assert_eq!(as_u64(&items[0]), Some(KIND_REQUEST));
                assert_eq!(as_u64(&items[1]), Some(7));
            }
            _ => panic!("request must encode as array"),
        }

        let note = Message::notification("plugin.handle_event", Value::Null).to_value();
        assert!(matches!(note, Value::Array(ref items) if items.len() == 3));
    }

    #[test]
    fn test_decoder_waits_for_complete_value() {
        let bytes = encode_message(&Message::ok(1, Value::Text("done".to_string()))).unwrap();
        let mut decoder = MessageDecoder::new();

        decoder.push(&bytes[..bytes.len() - 2]);
        assert_eq!(decoder.next_message().unwrap(), None);

        decoder.push(&bytes[bytes.len() - 2..]);
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::ok(1, Value::Text("done".to_string())))
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_splits_back_to_back_values() {
        let mut bytes = encode_message(&Message::request(1, "a", Value::Null)).unwrap();
        bytes.extend(encode_message(&Message::err(1, "nope")).unwrap());
        bytes.extend(encode_message(&Message::notification("n", params())).unwrap());

        let mut decoder = MessageDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(decoder.next_message().unwrap(), Some(Message::Request { .. })));
        match decoder.next_message().unwrap() {
            Some(Message::Response { error: Some(Value::Text(e)), .. }) => assert_eq!(e, "nope"),
            other => panic!("expected error response, got {:?}", other),
        }
        assert!(matches!(decoder.next_message().unwrap(), Some(Message::Notification { .. })));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_large_value_in_small_chunks() {
        let body = "x".repeat(4 * 1024 * 1024);
        let bytes = encode_message(&Message::ok(9, Value::Text(body.clone()))).unwrap();
        let mut decoder = MessageDecoder::new();

        let chunks: Vec<&[u8]> = bytes.chunks(READ_CHUNK).collect();
        let (last, head) = chunks.split_last().unwrap();
        for chunk in head {
            decoder.push(chunk);
            assert_eq!(decoder.next_message().unwrap(), None);
        }
        // Parked on the text head, waiting for its bytes
        assert!(decoder.scanner.pos > 0 && decoder.scanner.pos < 16);

        decoder.push(last);
        assert_eq!(decoder.next_message().unwrap(), Some(Message::ok(9, Value::Text(body))));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_scan_resumes_inside_dense_values() {
        let items: Vec<Value> = (0..50_000u64).map(|i| Value::Integer(i.into())).collect();
        let bytes = encode_message(&Message::ok(3, Value::Array(items.clone()))).unwrap();
        let mut decoder = MessageDecoder::new();

        let mut scanned = 0;
        let chunks: Vec<&[u8]> = bytes.chunks(1024).collect();
        let (last, head) = chunks.split_last().unwrap();
        for chunk in head {
            decoder.push(chunk);
            assert_eq!(decoder.next_message().unwrap(), None);
            assert!(decoder.scanner.pos >= scanned);
            scanned = decoder.scanner.pos;
        }
        assert!(scanned > bytes.len() / 2);

        decoder.push(last);
        assert_eq!(decoder.next_message().unwrap(), Some(Message::ok(3, Value::Array(items))));
    }

    #[test]
    fn test_indefinite_length_values() {
        // [_ 1, 5, null, true] followed by a stray break
        let mut decoder = MessageDecoder::new();
        decoder.push(&[0x9f, 0x01, 0x05, 0xf6]);
        assert_eq!(decoder.next_message().unwrap(), None);
        decoder.push(&[0xf5, 0xff]);
        assert_eq!(decoder.next_message().unwrap(), Some(Message::ok(5, Value::Bool(true))));

        decoder.push(&[0xff]);
        assert!(matches!(decoder.next_message(), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_oversized_text_rejected_from_header() {
        // Text head claiming 4 GB
        let mut decoder = MessageDecoder::new();
        decoder.push(&[0x84, 0x01, 0x01, 0xf6, 0x7a, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            decoder.next_message(),
            Err(CodecError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        assert!(Message::from_value(Value::Text("x".to_string())).is_err());
        assert!(Message::from_value(Value::Array(vec![Value::Integer(9.into())])).is_err());
        assert!(Message::from_value(Value::Array(vec![
            Value::Integer(0.into()),
            Value::Integer((-1).into()),
            Value::Text("m".to_string()),
        ]))
        .is_err());
    }

    #[tokio::test]
    async fn test_reader_reports_clean_and_truncated_eof() {
        let bytes = encode_message(&Message::ok(2, Value::Bool(true))).unwrap();

        let mut reader = MessageReader::new(bytes.as_slice());
        assert!(reader.read().await.unwrap().is_some());
        assert!(reader.read().await.unwrap().is_none());

        let truncated = &bytes[..bytes.len() - 1];
        let mut reader = MessageReader::new(truncated);
        assert!(matches!(reader.read().await, Err(CodecError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_writer_reader_over_socket() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let mut writer = MessageWriter::new(a);
        let mut reader = MessageReader::new(b);

        writer.write(&Message::request(5, "request.get_header", params())).await.unwrap();
        writer.write(&Message::ok(5, Value::Null)).await.unwrap();

        assert!(matches!(reader.read().await.unwrap(), Some(Message::Request { msgid: 5, .. })));
        assert!(matches!(reader.read().await.unwrap(), Some(Message::Response { msgid: 5, .. })));
    }
}
