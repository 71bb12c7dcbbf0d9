//! `CborRpc:1` client
//!
//! One socket, many concurrent phase invocations. A reader task owns the read
//! half and demultiplexes:
//!
//! - responses complete the pending call with the matching msgid
//! - requests from the plugin server are PDK calls for a running event and are
//!   forwarded to the task that dispatched that event
//!
//! A writer task owns the write half; everyone else queues messages to it.
//! The reader never runs capabilities itself, so one slow invocation cannot
//! stall the demultiplexing of another.

use super::codec::{Message, MessageReader, MessageWriter};
use crate::context::{PhaseResult, RequestContext};
use crate::instance::{ConfigFingerprint, InstanceId};
use crate::pdk::PdkContext;
use crate::phase::Phase;
use crate::protocol::CBOR_RPC_V1;
use crate::rpc::value::{as_u64, cbor_to_json, json_to_cbor, map_get};
use crate::rpc::{forget_instance, remote_failure, ClientHooks, ClientOptions, RpcClient, RpcError};
use async_trait::async_trait;
use ciborium::Value;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const METHOD_NEW_INSTANCE: &str = "plugin.new_instance";
pub const METHOD_HANDLE_EVENT: &str = "plugin.handle_event";
pub const METHOD_CLOSE_INSTANCE: &str = "plugin.close_instance";

type Reply = Result<Value, RpcError>;

/// A PDK call forwarded from the reader to the owning invocation
#[derive(Debug)]
struct PdkRequest {
    msgid: u32,
    method: String,
    args: Vec<JsonValue>,
}

enum WriterCommand {
    Write(Message),
    Shutdown,
}

/// Outstanding calls and running events of one connection
#[derive(Default)]
struct CallTable {
    pending: HashMap<u32, oneshot::Sender<Reply>>,
    events: HashMap<u64, mpsc::UnboundedSender<PdkRequest>>,
    closed: bool,
}

type SharedTable = Arc<Mutex<CallTable>>;

fn lock(table: &SharedTable) -> MutexGuard<'_, CallTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fail every pending call with `ConnectionLost` and end every event.
///
/// Entries are removed before their waiter is completed, so each waiter is
/// completed at most once no matter how many teardown paths run.
fn fail_all(table: &SharedTable) {
    let (pending, events) = {
        let mut t = lock(table);
        t.closed = true;
        (std::mem::take(&mut t.pending), std::mem::take(&mut t.events))
    };
    if !pending.is_empty() {
        debug!(pending = pending.len(), "Failing outstanding calls");
    }
    for (_, waiter) in pending {
        let _ = waiter.send(Err(RpcError::ConnectionLost));
    }
    drop(events);
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
        let table: SharedTable = Arc::new(Mutex::new(CallTable::default()));
        let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>(64);

        let writer_handle = tokio::spawn(writer_loop(
            MessageWriter::new(write_half),
            writer_rx,
            table.clone(),
        ));
        let reader_handle = tokio::spawn(reader_loop(
            MessageReader::new(read_half),
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

    async fn send(&self, message: Message) -> Result<(), RpcError> {
        self.writer_tx
            .send(WriterCommand::Write(message))
            .await
            .map_err(|_| RpcError::ConnectionLost)
    }

    /// Register a pending call and send the request.
    async fn call(
        &self,
        msgid: u32,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<Reply>, RpcError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = lock(&self.table);
            if table.closed {
                return Err(RpcError::ConnectionLost);
            }
            table.pending.insert(msgid, tx);
        }
        if let Err(e) = self.send(Message::request(msgid, method, params)).await {
            self.forget_call(msgid);
            return Err(e);
        }
        Ok(rx)
    }

    fn forget_call(&self, msgid: u32) {
        lock(&self.table).pending.remove(&msgid);
    }

    fn register_event(&self, event_id: u64, tx: mpsc::UnboundedSender<PdkRequest>) -> Result<(), RpcError> {
        let mut table = lock(&self.table);
        if table.closed {
            return Err(RpcError::ConnectionLost);
        }
        table.events.insert(event_id, tx);
        Ok(())
    }

    fn unregister_event(&self, event_id: u64) {
        lock(&self.table).events.remove(&event_id);
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
    mut writer: MessageWriter<W>,
    mut rx: mpsc::Receiver<WriterCommand>,
    table: SharedTable,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Write(message) => {
                if let Err(e) = writer.write(&message).await {
                    warn!(protocol = CBOR_RPC_V1, error = %e, "Writer error");
                    fail_all(&table);
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(
    mut reader: MessageReader<R>,
    table: SharedTable,
    writer_tx: mpsc::Sender<WriterCommand>,
) {
    loop {
        let message = match reader.read().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(protocol = CBOR_RPC_V1, "Plugin server closed the connection");
                break;
            }
            Err(e) => {
                warn!(protocol = CBOR_RPC_V1, error = %e, "Reader error");
                break;
            }
        };

        match message {
            Message::Response { msgid, error, result } => {
                let waiter = lock(&table).pending.remove(&msgid);
                match waiter {
                    Some(waiter) => {
                        let reply = match error {
                            None => Ok(result),
                            Some(e) => Err(RpcError::RemoteError(error_text(&e))),
                        };
                        let _ = waiter.send(reply);
                    }
                    None => debug!(msgid, "Dropping response nobody is waiting for"),
                }
            }
            Message::Request { msgid, method, params } => {
                if let Err(reason) = route_pdk_call(&table, msgid, method, params) {
                    debug!(msgid, reason = %reason, "Refusing PDK call");
                    let _ = writer_tx
                        .send(WriterCommand::Write(Message::err(msgid, &reason)))
                        .await;
                }
            }
            Message::Notification { method, .. } => {
                debug!(method = %method, "Ignoring notification from plugin server");
            }
        }
    }
    fail_all(&table);
}

/// Forward a PDK call to the invocation running `params[0]`.
fn route_pdk_call(table: &SharedTable, msgid: u32, method: String, params: Value) -> Result<(), String> {
    let mut items = match params {
        Value::Array(items) if !items.is_empty() => items.into_iter(),
        _ => return Err("PDK call params must be [event_id, [args...]]".to_string()),
    };
    let event_id = items
        .next()
        .as_ref()
        .and_then(as_u64)
        .ok_or_else(|| "PDK call is missing its event id".to_string())?;
    let args = match items.next() {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(args)) => args.iter().map(cbor_to_json).collect(),
        Some(single) => vec![cbor_to_json(&single)],
    };

    let route = lock(table).events.get(&event_id).cloned();
    let route = route.ok_or_else(|| format!("no phase in progress for event {}", event_id))?;
    route
        .send(PdkRequest { msgid, method, args })
        .map_err(|_| format!("no phase in progress for event {}", event_id))
}

fn error_text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => cbor_to_json(other).to_string(),
    }
}

fn parse_instance_id(value: &Value) -> Option<InstanceId> {
    match value {
        Value::Map(entries) => map_get(entries, "id").and_then(as_u64).map(InstanceId),
        other => as_u64(other).map(InstanceId),
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn event_params(
    instance: InstanceId,
    event_id: u64,
    phase: Phase,
    context: &RequestContext,
) -> Result<Value, RpcError> {
    let context = serde_json::to_value(context).map_err(|e| RpcError::Codec(e.to_string()))?;
    Ok(Value::Map(vec![
        (text("instance_id"), Value::Integer(instance.0.into())),
        (text("event_id"), Value::Integer(event_id.into())),
        (text("phase"), text(phase.as_str())),
        (text("context"), json_to_cbor(&context)),
    ]))
}

/// Client for the legacy bidirectional protocol.
pub struct LegacyClient {
    hooks: ClientHooks,
    options: ClientOptions,
    connection: Mutex<Option<Arc<Connection>>>,
    next_msgid: AtomicU32,
    next_event: AtomicU64,
}

impl LegacyClient {
    pub fn new(hooks: ClientHooks, options: ClientOptions) -> Self {
        Self {
            hooks,
            options,
            connection: Mutex::new(None),
            next_msgid: AtomicU32::new(1),
            next_event: AtomicU64::new(1),
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
        let params = Value::Map(vec![(text("id"), Value::Integer(instance.0.into()))]);
        self.request(METHOD_CLOSE_INSTANCE, params)
            .await
            .map_err(|e| match e {
                RpcError::RemoteError(message) => remote_failure(message, instance),
                other => other,
            })?;
        Ok(())
    }

    fn connection(&self) -> Result<Arc<Connection>, RpcError> {
        let guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) if conn.is_open() => Ok(conn.clone()),
            _ => Err(RpcError::ConnectionLost),
        }
    }

    fn next_msgid(&self) -> u32 {
        self.next_msgid.fetch_add(1, Ordering::Relaxed)
    }

    /// Control call bounded by the request timeout.
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let conn = self.connection()?;
        let msgid = self.next_msgid();
        let reply = conn.call(msgid, method, params).await?;
        match tokio::time::timeout(self.options.request_timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::ConnectionLost),
            Err(_) => {
                conn.forget_call(msgid);
                Err(RpcError::Timeout(self.options.request_timeout))
            }
        }
    }

    async fn create_instance(&self, plugin_name: &str, config: &JsonValue) -> Result<InstanceId, RpcError> {
        let params = Value::Map(vec![
            (text("name"), text(plugin_name)),
            (text("config"), json_to_cbor(config)),
        ]);
        let instantiation_failed = |reason: String| RpcError::InstantiationFailed {
            plugin: plugin_name.to_string(),
            reason,
        };
        let reply = self
            .request(METHOD_NEW_INSTANCE, params)
            .await
            .map_err(|e| match e {
                RpcError::RemoteError(reason) => instantiation_failed(reason),
                other => other,
            })?;
        parse_instance_id(&reply)
            .ok_or_else(|| instantiation_failed("reply carries no instance id".to_string()))
    }

    async fn run_event(
        &self,
        conn: &Connection,
        msgid: u32,
        params: Value,
        instance: InstanceId,
        mut ctx: PdkContext,
        mut pdk_rx: mpsc::UnboundedReceiver<PdkRequest>,
    ) -> Result<PhaseResult, RpcError> {
        let mut reply = conn.call(msgid, METHOD_HANDLE_EVENT, params).await?;
        loop {
            tokio::select! {
                biased;

                Some(call) = pdk_rx.recv() => {
                    self.serve_pdk(conn, &mut ctx, call).await;
                }
                outcome = &mut reply => {
                    // Calls that raced the completion are still answered
                    while let Ok(call) = pdk_rx.try_recv() {
                        self.serve_pdk(conn, &mut ctx, call).await;
                    }
                    return match outcome {
                        Ok(Ok(_)) => Ok(ctx.into_result()),
                        Ok(Err(RpcError::RemoteError(message))) => Err(remote_failure(message, instance)),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(RpcError::ConnectionLost),
                    };
                }
            }
        }
    }

    async fn serve_pdk(&self, conn: &Connection, ctx: &mut PdkContext, call: PdkRequest) {
        let reply = match self.hooks.pdk.invoke(ctx, &call.method, &call.args) {
            Ok(value) => Message::ok(call.msgid, json_to_cbor(&value)),
            Err(e) => {
                debug!(method = %call.method, error = %e, "PDK call failed");
                Message::err(call.msgid, &e.to_string())
            }
        };
        let _ = conn.send(reply).await;
    }
}

#[async_trait]
impl RpcClient for LegacyClient {
    fn protocol(&self) -> &'static str {
        CBOR_RPC_V1
    }

    async fn connect(&self, socket: &Path) -> Result<(), RpcError> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| RpcError::ConnectFailed {
                socket: socket.display().to_string(),
                reason: e.to_string(),
            })?;
        self.attach(stream);
        info!(protocol = CBOR_RPC_V1, socket = %socket.display(), "Connected to plugin server");
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
                info!(protocol = CBOR_RPC_V1, plugin = plugin_name, instance = %id, config = %fp, "Instance created");
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
        let event_id = self.next_event.fetch_add(1, Ordering::Relaxed);
        let msgid = self.next_msgid();
        let params = event_params(instance, event_id, phase, &context)?;

        let (pdk_tx, pdk_rx) = mpsc::unbounded_channel();
        conn.register_event(event_id, pdk_tx)?;
        debug!(protocol = CBOR_RPC_V1, instance = %instance, %phase, event_id, "Dispatching phase");

        let ctx = PdkContext::new(phase, context);
        let outcome = tokio::time::timeout(
            timeout,
            self.run_event(&conn, msgid, params, instance, ctx, pdk_rx),
        )
        .await;
        conn.unregister_event(event_id);

        match outcome {
            Ok(result) => result,
            Err(_) => {
                conn.forget_call(msgid);
                warn!(protocol = CBOR_RPC_V1, instance = %instance, %phase, event_id, "Phase timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    async fn notify(
        &self,
        instance: InstanceId,
        phase: Phase,
        context: RequestContext,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        if !self.options.notification_phases.contains(&phase) {
            return self.dispatch(instance, phase, context, timeout).await.map(|_| ());
        }
        let conn = self.connection()?;
        // The event is never registered, so PDK calls for it are refused
        let event_id = self.next_event.fetch_add(1, Ordering::Relaxed);
        let params = event_params(instance, event_id, phase, &context)?;
        debug!(protocol = CBOR_RPC_V1, instance = %instance, %phase, event_id, "Notifying phase");
        conn.send(Message::notification(METHOD_HANDLE_EVENT, params)).await
    }

    async fn reset_instance(&self, plugin_name: &str, config: &JsonValue) {
        forget_instance(&self.hooks, CBOR_RPC_V1, plugin_name, config);
    }

    async fn close(&self) {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(connection) = connection {
            connection.shutdown();
            info!(protocol = CBOR_RPC_V1, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HeaderMutation;
    use crate::instance::InstanceRegistry;
    use crate::pdk::{builtin, PdkBridge};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    type PeerReader = MessageReader<tokio::net::unix::OwnedReadHalf>;
    type PeerWriter = MessageWriter<tokio::net::unix::OwnedWriteHalf>;

    fn hooks() -> ClientHooks {
        ClientHooks::new(
            Arc::new(InstanceRegistry::new()),
            PdkBridge::new(builtin::capabilities()),
        )
    }

    fn connected(options: ClientOptions) -> (LegacyClient, PeerReader, PeerWriter) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let client = LegacyClient::new(hooks(), options);
        client.attach(ours);
        let (r, w) = theirs.into_split();
        (client, MessageReader::new(r), MessageWriter::new(w))
    }

    fn param<'a>(params: &'a Value, key: &str) -> &'a Value {
        match params {
            Value::Map(entries) => map_get(entries, key).unwrap(),
            _ => panic!("params must be a map"),
        }
    }

    fn context_path(params: &Value) -> String {
        cbor_to_json(param(params, "context"))["path"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn expect_request(reader: &mut PeerReader) -> (u32, String, Value) {
        match reader.read().await.unwrap() {
            Some(Message::Request { msgid, method, params }) => (msgid, method, params),
            other => panic!("expected request, got {:?}", other),
        }
    }

    /// Serves `plugin.new_instance` with increasing ids, counting calls.
    fn spawn_instance_server(mut reader: PeerReader, mut writer: PeerWriter, creates: Arc<AtomicUsize>) {
        tokio::spawn(async move {
            while let Ok(Some(message)) = reader.read().await {
                if let Message::Request { msgid, method, .. } = message {
                    assert_eq!(method, METHOD_NEW_INSTANCE);
                    let n = creates.fetch_add(1, Ordering::SeqCst) + 1;
                    let reply = Value::Map(vec![(text("id"), Value::Integer((n as u64).into()))]);
                    writer.write(&Message::ok(msgid, reply)).await.unwrap();
                }
            }
        });
    }

    const PHASE_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_instance_reused_for_same_config() {
        let (client, reader, writer) = connected(ClientOptions::default());
        let creates = Arc::new(AtomicUsize::new(0));
        spawn_instance_server(reader, writer, creates.clone());

        let config = json!({"limit": 10});
        let a = client.get_or_create_instance("rate-limit", &config).await.unwrap();
        let b = client.get_or_create_instance("rate-limit", &config).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(creates.load(Ordering::SeqCst), 1);

        let c = client
            .get_or_create_instance("rate-limit", &json!({"limit": 11}))
            .await
            .unwrap();
        assert_ne!(a, c);
        assert_eq!(creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_creators_share_one_instance() {
        let (client, reader, writer) = connected(ClientOptions::default());
        let creates = Arc::new(AtomicUsize::new(0));
        spawn_instance_server(reader, writer, creates.clone());
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client.get_or_create_instance("p", &json!({})).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_instantiation_error_is_reported() {
        let (client, mut reader, mut writer) = connected(ClientOptions::default());
        tokio::spawn(async move {
            let (msgid, _, _) = expect_request(&mut reader).await;
            writer.write(&Message::err(msgid, "bad config")).await.unwrap();
        });

        let err = client.get_or_create_instance("p", &json!({})).await.unwrap_err();
        assert_eq!(
            err,
            RpcError::InstantiationFailed {
                plugin: "p".to_string(),
                reason: "bad config".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_fails_every_pending_dispatch() {
        let (client, mut reader, writer) = connected(ClientOptions::default());
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for path in ["/a", "/b"] {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client
                    .dispatch(InstanceId(1), Phase::Access, RequestContext::new("GET", path), PHASE_TIMEOUT)
                    .await
            }));
        }
        expect_request(&mut reader).await;
        expect_request(&mut reader).await;
        drop(reader);
        drop(writer);

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap_err(), RpcError::ConnectionLost);
        }
        assert!(!client.is_connected());
        let err = client
            .dispatch(InstanceId(1), Phase::Access, RequestContext::default(), PHASE_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::ConnectionLost);
    }

    #[tokio::test]
    async fn test_close_fails_pending_dispatch() {
        let (client, mut reader, _writer) = connected(ClientOptions::default());
        let client = Arc::new(client);

        let task = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .dispatch(InstanceId(1), Phase::Rewrite, RequestContext::default(), PHASE_TIMEOUT)
                    .await
            })
        };
        expect_request(&mut reader).await;
        client.close().await;
        assert_eq!(task.await.unwrap().unwrap_err(), RpcError::ConnectionLost);
    }

    #[tokio::test]
    async fn test_pdk_calls_served_in_receipt_order() {
        let (client, mut reader, mut writer) = connected(ClientOptions::default());

        tokio::spawn(async move {
            let (msgid, method, params) = expect_request(&mut reader).await;
            assert_eq!(method, METHOD_HANDLE_EVENT);
            let event_id = as_u64(param(&params, "event_id")).unwrap();

            for (i, value) in ["a", "b", "c"].iter().enumerate() {
                let args = Value::Array(vec![
                    Value::Integer(event_id.into()),
                    Value::Array(vec![text("x-order"), text(value)]),
                ]);
                writer
                    .write(&Message::request(1000 + i as u32, "service.request.add_header", args))
                    .await
                    .unwrap();
            }
            for i in 0..3u32 {
                match reader.read().await.unwrap() {
                    Some(Message::Response { msgid, error: None, .. }) => assert_eq!(msgid, 1000 + i),
                    other => panic!("expected PDK reply, got {:?}", other),
                }
            }
            writer.write(&Message::ok(msgid, Value::Null)).await.unwrap();
        });

        let result = client
            .dispatch(InstanceId(3), Phase::Access, RequestContext::new("GET", "/"), PHASE_TIMEOUT)
            .await
            .unwrap();
        let values: Vec<_> = result
            .upstream_headers
            .iter()
            .map(|m| match m {
                HeaderMutation::Add { value, .. } => value.as_str(),
                other => panic!("unexpected mutation {:?}", other),
            })
            .collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_slow_invocation_does_not_block_another() {
        let (client, mut reader, mut writer) = connected(ClientOptions::default());
        let client = Arc::new(client);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut slow = None;
            let mut fast = None;
            for _ in 0..2 {
                let (msgid, _, params) = expect_request(&mut reader).await;
                if context_path(&params) == "/slow" {
                    slow = Some(msgid);
                } else {
                    fast = Some(msgid);
                }
            }
            writer.write(&Message::ok(fast.unwrap(), Value::Null)).await.unwrap();
            release_rx.await.unwrap();
            writer.write(&Message::ok(slow.unwrap(), Value::Null)).await.unwrap();
        });

        let slow_task = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .dispatch(InstanceId(1), Phase::Access, RequestContext::new("GET", "/slow"), PHASE_TIMEOUT)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let fast = client
            .dispatch(InstanceId(1), Phase::Access, RequestContext::new("GET", "/fast"), PHASE_TIMEOUT)
            .await;
        assert!(fast.is_ok());
        assert!(!slow_task.is_finished());

        release_tx.send(()).unwrap();
        assert!(slow_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_timeout_leaves_instance_usable() {
        let (client, mut reader, mut writer) = connected(ClientOptions::default());
        let instance = InstanceId(8);
        client
            .hooks
            .instances
            .record("p", &ConfigFingerprint::of(&json!({})), instance);

        tokio::spawn(async move {
            let (first, _, _) = expect_request(&mut reader).await;
            let (second, _, _) = expect_request(&mut reader).await;
            // Late reply for the abandoned call is dropped
            writer.write(&Message::ok(first, Value::Null)).await.unwrap();
            writer.write(&Message::ok(second, Value::Null)).await.unwrap();
        });

        let err = client
            .dispatch(instance, Phase::Access, RequestContext::default(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Timeout(Duration::from_millis(50)));

        let result = client
            .dispatch(instance, Phase::Access, RequestContext::default(), PHASE_TIMEOUT)
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(
            client.get_or_create_instance("p", &json!({})).await.unwrap(),
            instance
        );
    }

    #[tokio::test]
    async fn test_unknown_instance_reported() {
        let (client, mut reader, mut writer) = connected(ClientOptions::default());
        tokio::spawn(async move {
            let (msgid, _, _) = expect_request(&mut reader).await;
            writer.write(&Message::err(msgid, "no plugin instance 5")).await.unwrap();
        });

        let err = client
            .dispatch(InstanceId(5), Phase::Access, RequestContext::default(), PHASE_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::InstanceNotFound(InstanceId(5)));
    }

    #[tokio::test]
    async fn test_pdk_call_for_unknown_event_is_refused() {
        let (_client, mut reader, mut writer) = connected(ClientOptions::default());
        let args = Value::Array(vec![Value::Integer(999.into()), Value::Array(vec![])]);
        writer
            .write(&Message::request(42, "request.get_method", args))
            .await
            .unwrap();

        match reader.read().await.unwrap() {
            Some(Message::Response { msgid: 42, error: Some(Value::Text(e)), .. }) => {
                assert!(e.contains("no phase in progress"));
            }
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notification_phase_is_not_awaited() {
        let options = ClientOptions {
            notification_phases: vec![Phase::Log],
            ..ClientOptions::default()
        };
        let (client, mut reader, _writer) = connected(options);

        client
            .notify(InstanceId(2), Phase::Log, RequestContext::new("GET", "/done"), PHASE_TIMEOUT)
            .await
            .unwrap();

        match reader.read().await.unwrap() {
            Some(Message::Notification { method, params }) => {
                assert_eq!(method, METHOD_HANDLE_EVENT);
                assert_eq!(param(&params, "phase"), &text("log"));
                assert_eq!(context_path(&params), "/done");
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_clears_instances() {
        let (client, _reader, _writer) = connected(ClientOptions::default());
        let fp = ConfigFingerprint::of(&json!({}));
        client.hooks.instances.record("p", &fp, InstanceId(1));

        let (ours, _theirs) = UnixStream::pair().unwrap();
        client.attach(ours);
        assert_eq!(client.hooks.instances.lookup("p", &fp), None);
        assert!(client.is_connected());
    }
}
