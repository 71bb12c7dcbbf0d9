//! `CborFrame:1` client
//!
//! Every instance creation and every phase invocation opens its own logical
//! stream, identified by a fresh UUID. The reader task routes incoming frames
//! by stream id onto one unbounded channel per stream, so a stream whose
//! owner is busy serving PDK calls never holds up frames for another.

use super::frame::{Frame, FrameType, StreamId};
use super::io::{FrameError, FrameReader, FrameWriter};
use crate::context::{PhaseResult, RequestContext};
use crate::instance::{ConfigFingerprint, InstanceId};
use crate::pdk::PdkContext;
use crate::phase::Phase;
use crate::protocol::CBOR_FRAME_V1;
use crate::rpc::value::{cbor_to_json, json_to_cbor};
use crate::rpc::{forget_instance, remote_failure, ClientHooks, ClientOptions, RpcClient, RpcError};
use async_trait::async_trait;
use ciborium::Value;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum WriterCommand {
    Write(Frame),
    Shutdown,
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<StreamId, mpsc::UnboundedSender<Frame>>,
    closed: bool,
}

type SharedTable = Arc<Mutex<StreamTable>>;

fn lock(table: &SharedTable) -> MutexGuard<'_, StreamTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// End every open stream. Owners observe the closed channel as
/// `ConnectionLost`.
fn fail_all(table: &SharedTable) {
    let streams = {
        let mut t = lock(table);
        t.closed = true;
        std::mem::take(&mut t.streams)
    };
    if !streams.is_empty() {
        debug!(protocol = CBOR_FRAME_V1, open = streams.len(), "Failing open streams");
    }
}

struct Connection {
    writer_tx: mpsc::Sender<WriterCommand>,
    table: SharedTable,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Connection {
    fn open<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let table: SharedTable = Arc::new(Mutex::new(StreamTable::default()));
        let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>(64);

        let writer_handle = tokio::spawn(writer_loop(
            FrameWriter::new(write_half),
            writer_rx,
            table.clone(),
        ));
        let reader_handle = tokio::spawn(reader_loop(
            FrameReader::new(read_half),
            table.clone(),
            writer_tx.clone(),
        ));

        Self {
            writer_tx,
            table,
            reader_handle,
            writer_handle,
        }
    }

    fn is_open(&self) -> bool {
        !lock(&self.table).closed
    }

    fn open_stream(&self, id: StreamId) -> Result<mpsc::UnboundedReceiver<Frame>, RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = lock(&self.table);
        if table.closed {
            return Err(RpcError::ConnectionLost);
        }
        table.streams.insert(id, tx);
        Ok(rx)
    }

    fn close_stream(&self, id: &StreamId) {
        lock(&self.table).streams.remove(id);
    }

    async fn send(&self, frame: Frame) -> Result<(), RpcError> {
        self.writer_tx
            .send(WriterCommand::Write(frame))
            .await
            .map_err(|_| RpcError::ConnectionLost)
    }

    fn shutdown(&self) {
        fail_all(&self.table);
        let _ = self.writer_tx.try_send(WriterCommand::Shutdown);
        self.reader_handle.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<WriterCommand>,
    table: SharedTable,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Write(frame) => {
                if let Err(e) = writer.write(&frame).await {
                    warn!(protocol = CBOR_FRAME_V1, error = %e, "Writer error");
                    fail_all(&table);
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    table: SharedTable,
    writer_tx: mpsc::Sender<WriterCommand>,
) {
    loop {
        let frame = match reader.read().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(protocol = CBOR_FRAME_V1, "Plugin server closed the connection");
                break;
            }
            Err(FrameError::UnsupportedVersion(v)) => {
                error!(protocol = CBOR_FRAME_V1, version = v, "Plugin server speaks an unsupported frame version");
                break;
            }
            Err(FrameError::UnknownFrameType { frame_type, stream }) => {
                warn!(protocol = CBOR_FRAME_V1, frame_type, %stream, "Skipping frame of unknown type");
                continue;
            }
            Err(e) => {
                warn!(protocol = CBOR_FRAME_V1, error = %e, "Reader error");
                break;
            }
        };

        let route = lock(&table).streams.get(&frame.stream).cloned();
        match route {
            Some(route) => {
                let _ = route.send(frame);
            }
            None if frame.frame_type == FrameType::PdkCall => {
                debug!(stream = %frame.stream, "Refusing PDK call for unknown stream");
                let reply = Frame::pdk_result(
                    frame.stream.clone(),
                    frame.seq,
                    Err(format!("no phase in progress on stream {}", frame.stream)),
                );
                let _ = writer_tx.send(WriterCommand::Write(reply)).await;
            }
            None => {
                debug!(stream = %frame.stream, frame_type = ?frame.frame_type, "Dropping frame for closed stream");
            }
        }
    }
    fail_all(&table);
}

fn pdk_args(payload: Option<Value>) -> Vec<JsonValue> {
    match payload {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(cbor_to_json).collect(),
        Some(single) => vec![cbor_to_json(&single)],
    }
}

/// Client for the structured, versioned frame protocol.
pub struct FramedClient {
    hooks: ClientHooks,
    options: ClientOptions,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl FramedClient {
    pub fn new(hooks: ClientHooks, options: ClientOptions) -> Self {
        Self {
            hooks,
            options,
            connection: Mutex::new(None),
        }
    }

    /// Use an already-connected stream as the transport.
    pub fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Arc::new(Connection::open(stream));
        self.hooks.instances.clear();
        let previous = self
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(connection);
        if let Some(previous) = previous {
            previous.shutdown();
        }
    }

    /// Ask the plugin server to drop an instance.
    pub async fn close_instance(&self, instance: InstanceId) -> Result<(), RpcError> {
        let reply = self
            .exchange(Frame::close_instance(StreamId::new_uuid(), instance.0))
            .await?;
        match reply.frame_type {
            FrameType::InstanceClosed => Ok(()),
            FrameType::Error => Err(remote_failure(reply.message.unwrap_or_default(), instance)),
            other => Err(RpcError::Protocol(format!("unexpected {:?} reply to close", other))),
        }
    }

    fn connection(&self) -> Result<Arc<Connection>, RpcError> {
        let guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) if conn.is_open() => Ok(conn.clone()),
            _ => Err(RpcError::ConnectionLost),
        }
    }

    /// Send a single-frame request on a fresh stream and wait for the reply.
    async fn exchange(&self, frame: Frame) -> Result<Frame, RpcError> {
        let conn = self.connection()?;
        let stream = frame.stream.clone();
        let mut rx = conn.open_stream(stream.clone())?;

        let reply = async {
            conn.send(frame).await?;
            rx.recv().await.ok_or(RpcError::ConnectionLost)
        };
        let outcome = tokio::time::timeout(self.options.request_timeout, reply).await;
        conn.close_stream(&stream);
        outcome.unwrap_or(Err(RpcError::Timeout(self.options.request_timeout)))
    }

    async fn create_instance(&self, plugin_name: &str, config: &JsonValue) -> Result<InstanceId, RpcError> {
        let instantiation_failed = |reason: String| RpcError::InstantiationFailed {
            plugin: plugin_name.to_string(),
            reason,
        };
        let frame = Frame::create_instance(StreamId::new_uuid(), plugin_name, json_to_cbor(config));
        let reply = self.exchange(frame).await?;
        match reply.frame_type {
            FrameType::InstanceCreated => reply
                .instance
                .map(InstanceId)
                .ok_or_else(|| instantiation_failed("reply carries no instance id".to_string())),
            FrameType::Error => Err(instantiation_failed(reply.message.unwrap_or_default())),
            other => Err(RpcError::Protocol(format!("unexpected {:?} reply to create", other))),
        }
    }

    async fn run_stream(
        &self,
        conn: &Connection,
        stream: StreamId,
        start: Frame,
        instance: InstanceId,
        mut ctx: PdkContext,
        rx: &mut mpsc::UnboundedReceiver<Frame>,
    ) -> Result<PhaseResult, RpcError> {
        conn.send(start).await?;

        while let Some(frame) = rx.recv().await {
            match frame.frame_type {
                FrameType::PdkCall => {
                    let method = frame.method.clone().unwrap_or_default();
                    let args = pdk_args(frame.payload);
                    let result = match self.hooks.pdk.invoke(&mut ctx, &method, &args) {
                        Ok(value) => Ok(json_to_cbor(&value)),
                        Err(e) => {
                            debug!(method = %method, error = %e, "PDK call failed");
                            Err(e.to_string())
                        }
                    };
                    conn.send(Frame::pdk_result(stream.clone(), frame.seq, result)).await?;
                }
                FrameType::PhaseResult => return Ok(ctx.into_result()),
                FrameType::Error => {
                    return Err(remote_failure(frame.message.unwrap_or_default(), instance));
                }
                other => {
                    return Err(RpcError::Protocol(format!(
                        "unexpected {:?} frame on phase stream",
                        other
                    )));
                }
            }
        }
        Err(RpcError::ConnectionLost)
    }
}

#[async_trait]
impl RpcClient for FramedClient {
    fn protocol(&self) -> &'static str {
        CBOR_FRAME_V1
    }

    async fn connect(&self, socket: &Path) -> Result<(), RpcError> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| RpcError::ConnectFailed {
                socket: socket.display().to_string(),
                reason: e.to_string(),
            })?;
        self.attach(stream);
        info!(protocol = CBOR_FRAME_V1, socket = %socket.display(), "Connected to plugin server");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection().is_ok()
    }

    async fn get_or_create_instance(
        &self,
        plugin_name: &str,
        config: &JsonValue,
    ) -> Result<InstanceId, RpcError> {
        let fingerprint = ConfigFingerprint::of(config);
        let fp = &fingerprint;
        let instances = self.hooks.instances.clone();
        instances
            .get_or_create(plugin_name, fp, move || async move {
                let id = self.create_instance(plugin_name, config).await?;
                info!(protocol = CBOR_FRAME_V1, plugin = plugin_name, instance = %id, config = %fp, "Instance created");
                Ok::<_, RpcError>(id)
            })
            .await
    }

    async fn dispatch(
        &self,
        instance: InstanceId,
        phase: Phase,
        context: RequestContext,
        timeout: Duration,
    ) -> Result<PhaseResult, RpcError> {
        let conn = self.connection()?;
        let context_value =
            serde_json::to_value(&context).map_err(|e| RpcError::Codec(e.to_string()))?;
        let stream = StreamId::new_uuid();
        let start = Frame::start_phase(
            stream.clone(),
            instance.0,
            phase.as_str(),
            json_to_cbor(&context_value),
        );

        let mut rx = conn.open_stream(stream.clone())?;
        debug!(protocol = CBOR_FRAME_V1, instance = %instance, %phase, %stream, "Dispatching phase");

        let ctx = PdkContext::new(phase, context);
        let outcome = tokio::time::timeout(
            timeout,
            self.run_stream(&conn, stream.clone(), start, instance, ctx, &mut rx),
        )
        .await;
        conn.close_stream(&stream);

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(protocol = CBOR_FRAME_V1, instance = %instance, %phase, %stream, "Phase timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    async fn reset_instance(&self, plugin_name: &str, config: &JsonValue) {
        forget_instance(&self.hooks, CBOR_FRAME_V1, plugin_name, config);
    }

    async fn close(&self) {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(connection) = connection {
            connection.shutdown();
            info!(protocol = CBOR_FRAME_V1, "Connection closed");
        }
    }
}
