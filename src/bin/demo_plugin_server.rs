//! demo-plugin-server - a plugin server hosting the `header-echo` plugin
//!
//! Speaks either wire protocol, so it doubles as the peer for integration
//! tests of the supervisor and both RPC clients.
//!
//! ## Invocation
//!
//! - `demo-plugin-server --dump [--protocol ID] [SOCKET]` prints the plugin
//!   description as JSON and exits; SOCKET is accepted and ignored
//! - `demo-plugin-server [--protocol ID] SOCKET` serves on SOCKET until killed
//!
//! ## The plugin
//!
//! `access`: copies the `x-echo` request header to an upstream header
//! (`x-echoed`, or the `header` config value), and short-circuits with 403
//! when `x-deny` is present. A `delay_ms` config value stalls the phase.
//! `log`: writes one line through the gateway log.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ciborium::Value;
use clap::Parser;
use pluginserver::rpc::framed::{Frame, FrameError, FrameReader, FrameType, FrameWriter, StreamId};
use pluginserver::rpc::legacy::client::{METHOD_CLOSE_INSTANCE, METHOD_HANDLE_EVENT, METHOD_NEW_INSTANCE};
use pluginserver::rpc::legacy::{Message, MessageReader, MessageWriter};
use pluginserver::rpc::value::{as_u64, cbor_to_json, json_to_cbor, map_get};
use pluginserver::rpc::INSTANCE_NOT_FOUND;
use pluginserver::{Phase, PluginInfo, CBOR_FRAME_V1, CBOR_RPC_V1};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const PLUGIN_NAME: &str = "header-echo";

#[derive(Parser, Debug)]
#[command(name = "demo-plugin-server", version, about = "Plugin server hosting the header-echo plugin")]
struct Args {
    /// Print the plugin description as JSON and exit
    #[arg(long)]
    dump: bool,

    /// Wire protocol to serve
    #[arg(long, default_value = CBOR_RPC_V1)]
    protocol: String,

    /// Unix socket to listen on
    socket: Option<PathBuf>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn not_found(instance: u64) -> String {
    format!("{} {}", INSTANCE_NOT_FOUND, instance)
}

// =============================================================================
// PLUGIN
// =============================================================================

fn describe(protocol: &str) -> PluginInfo {
    PluginInfo {
        name: PLUGIN_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        priority: 1000,
        phases: vec![Phase::Access, Phase::Log],
        protocol: Some(protocol.to_string()),
        schema: json!({
            "type": "object",
            "properties": {
                "header": { "type": "string" },
                "delay_ms": { "type": "integer" }
            }
        }),
    }
}

/// Calls back into the gateway on behalf of one phase invocation.
#[async_trait]
trait Gateway: Send {
    async fn call(&mut self, method: &str, args: Vec<JsonValue>) -> Result<JsonValue, String>;
}

async fn run_phase(gateway: &mut dyn Gateway, config: &JsonValue, phase: &str) -> Result<(), String> {
    match phase {
        "access" => {
            if let Some(ms) = config.get("delay_ms").and_then(JsonValue::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let echo = gateway.call("request.get_header", vec![json!("x-echo")]).await?;
            if let Some(value) = echo.as_str() {
                let header = config.get("header").and_then(JsonValue::as_str).unwrap_or("x-echoed");
                gateway
                    .call("service.request.set_header", vec![json!(header), json!(value)])
                    .await?;
            }
            let deny = gateway.call("request.get_header", vec![json!("x-deny")]).await?;
            if !deny.is_null() {
                gateway
                    .call("response.exit", vec![json!(403), json!("denied by header-echo")])
                    .await?;
            }
            Ok(())
        }
        "log" => {
            gateway
                .call("log.info", vec![json!("header-echo handled a request")])
                .await?;
            Ok(())
        }
        other => Err(format!("{} does not handle phase {}", PLUGIN_NAME, other)),
    }
}

/// Instances live for the whole process, across connections.
#[derive(Default)]
struct Instances {
    next: AtomicU64,
    configs: Mutex<HashMap<u64, JsonValue>>,
}

impl Instances {
    fn create(&self, name: &str, config: JsonValue) -> Result<u64, String> {
        if name != PLUGIN_NAME {
            return Err(format!("unknown plugin {}", name));
        }
        if !config.is_object() && !config.is_null() {
            return Err("configuration must be an object".to_string());
        }
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.configs).insert(id, config);
        debug!(instance = id, "Instance created");
        Ok(id)
    }

    fn config(&self, id: u64) -> Option<JsonValue> {
        lock(&self.configs).get(&id).cloned()
    }

    fn close(&self, id: u64) -> bool {
        lock(&self.configs).remove(&id).is_some()
    }
}

// =============================================================================
// CborRpc:1
// =============================================================================

struct LegacyPeer {
    out: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Value, String>>>>,
    next_msgid: AtomicU32,
}

struct LegacyGateway {
    peer: Arc<LegacyPeer>,
    event_id: u64,
}

#[async_trait]
impl Gateway for LegacyGateway {
    async fn call(&mut self, method: &str, args: Vec<JsonValue>) -> Result<JsonValue, String> {
        let msgid = self.peer.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.peer.pending).insert(msgid, tx);

        let params = Value::Array(vec![
            Value::Integer(self.event_id.into()),
            Value::Array(args.iter().map(json_to_cbor).collect()),
        ]);
        self.peer
            .out
            .send(Message::request(msgid, method, params))
            .map_err(|_| "connection closed".to_string())?;
        let reply = rx.await.map_err(|_| "connection closed".to_string())??;
        Ok(cbor_to_json(&reply))
    }
}

struct Event {
    instance: u64,
    event_id: u64,
    phase: String,
}

fn parse_event(params: &Value) -> Option<Event> {
    let Value::Map(fields) = params else {
        return None;
    };
    Some(Event {
        instance: map_get(fields, "instance_id").and_then(as_u64)?,
        event_id: map_get(fields, "event_id").and_then(as_u64)?,
        phase: map_get(fields, "phase")?.as_text()?.to_string(),
    })
}

async fn serve_legacy(stream: UnixStream, instances: Arc<Instances>) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        let mut writer = MessageWriter::new(write_half);
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = writer.write(&message).await {
                warn!(error = %e, "Write failed");
                break;
            }
        }
    });

    let peer = Arc::new(LegacyPeer {
        out: out_tx,
        pending: Mutex::new(HashMap::new()),
        next_msgid: AtomicU32::new(1),
    });
    let mut reader = MessageReader::new(read_half);
    loop {
        let message = match reader.read().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Read failed");
                break;
            }
        };
        match message {
            Message::Request { msgid, method, params } => {
                on_legacy_request(&peer, &instances, msgid, &method, params);
            }
            Message::Notification { method, params } if method == METHOD_HANDLE_EVENT => {
                if let Some(event) = parse_event(&params) {
                    if let Some(config) = instances.config(event.instance) {
                        let mut gateway = LegacyGateway {
                            peer: peer.clone(),
                            event_id: event.event_id,
                        };
                        tokio::spawn(async move {
                            if let Err(e) = run_phase(&mut gateway, &config, &event.phase).await {
                                debug!(error = %e, "Notified phase failed");
                            }
                        });
                    }
                }
            }
            Message::Notification { method, .. } => debug!(%method, "Ignoring notification"),
            Message::Response { msgid, error, result } => {
                if let Some(tx) = lock(&peer.pending).remove(&msgid) {
                    let outcome = match error {
                        Some(Value::Text(message)) => Err(message),
                        Some(other) => Err(cbor_to_json(&other).to_string()),
                        None => Ok(result),
                    };
                    let _ = tx.send(outcome);
                }
            }
        }
    }
    writer.abort();
}

fn on_legacy_request(peer: &Arc<LegacyPeer>, instances: &Arc<Instances>, msgid: u32, method: &str, params: Value) {
    let reply = |message: Message| {
        let _ = peer.out.send(message);
    };
    let fields: &[(Value, Value)] = match &params {
        Value::Map(fields) => fields.as_slice(),
        _ => &[],
    };

    match method {
        METHOD_NEW_INSTANCE => {
            let name = map_get(fields, "name").and_then(Value::as_text).unwrap_or_default();
            let config = map_get(fields, "config").map(cbor_to_json).unwrap_or(JsonValue::Null);
            match instances.create(name, config) {
                Ok(id) => reply(Message::ok(msgid, Value::Map(vec![(text("id"), Value::Integer(id.into()))]))),
                Err(e) => reply(Message::err(msgid, &e)),
            }
        }
        METHOD_HANDLE_EVENT => {
            let Some(event) = parse_event(&params) else {
                reply(Message::err(msgid, "malformed event"));
                return;
            };
            let Some(config) = instances.config(event.instance) else {
                reply(Message::err(msgid, &not_found(event.instance)));
                return;
            };
            let peer = peer.clone();
            tokio::spawn(async move {
                let mut gateway = LegacyGateway {
                    peer: peer.clone(),
                    event_id: event.event_id,
                };
                let message = match run_phase(&mut gateway, &config, &event.phase).await {
                    Ok(()) => Message::ok(msgid, Value::Null),
                    Err(e) => Message::err(msgid, &e),
                };
                let _ = peer.out.send(message);
            });
        }
        METHOD_CLOSE_INSTANCE => {
            let id = map_get(fields, "id").and_then(as_u64).unwrap_or_default();
            if instances.close(id) {
                reply(Message::ok(msgid, Value::Null));
            } else {
                reply(Message::err(msgid, &not_found(id)));
            }
        }
        other => reply(Message::err(msgid, &format!("unknown method {}", other))),
    }
}

// =============================================================================
// CborFrame:1
// =============================================================================

struct FramedPeer {
    out: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<(StreamId, u64), oneshot::Sender<Result<Value, String>>>>,
}

struct FramedGateway {
    peer: Arc<FramedPeer>,
    stream: StreamId,
    seq: u64,
}

#[async_trait]
impl Gateway for FramedGateway {
    async fn call(&mut self, method: &str, args: Vec<JsonValue>) -> Result<JsonValue, String> {
        self.seq += 1;
        let (tx, rx) = oneshot::channel();
        lock(&self.peer.pending).insert((self.stream.clone(), self.seq), tx);

        let args = Value::Array(args.iter().map(json_to_cbor).collect());
        self.peer
            .out
            .send(Frame::pdk_call(self.stream.clone(), self.seq, method, args))
            .map_err(|_| "connection closed".to_string())?;
        let reply = rx.await.map_err(|_| "connection closed".to_string())??;
        Ok(cbor_to_json(&reply))
    }
}

async fn serve_framed(stream: UnixStream, instances: Arc<Instances>) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = writer.write(&frame).await {
                warn!(error = %e, "Write failed");
                break;
            }
        }
    });

    let peer = Arc::new(FramedPeer {
        out: out_tx,
        pending: Mutex::new(HashMap::new()),
    });
    let mut reader = FrameReader::new(read_half);
    loop {
        let frame = match reader.read().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(FrameError::UnsupportedVersion(v)) => {
                warn!(version = v, "Peer speaks an unsupported frame version");
                break;
            }
            Err(FrameError::UnknownFrameType { frame_type, stream }) => {
                warn!(frame_type, %stream, "Skipping frame of unknown type");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Read failed");
                break;
            }
        };
        on_frame(&peer, &instances, frame);
    }
    writer.abort();
}

fn on_frame(peer: &Arc<FramedPeer>, instances: &Arc<Instances>, frame: Frame) {
    let reply = |frame: Frame| {
        let _ = peer.out.send(frame);
    };
    let stream = frame.stream.clone();

    match frame.frame_type {
        FrameType::CreateInstance => {
            let name = frame.method.as_deref().unwrap_or_default();
            let config = frame.payload.as_ref().map(cbor_to_json).unwrap_or(JsonValue::Null);
            match instances.create(name, config) {
                Ok(id) => reply(Frame::instance_created(stream, id)),
                Err(e) => reply(Frame::error(stream, &e)),
            }
        }
        FrameType::StartPhase => {
            let id = frame.instance.unwrap_or_default();
            let Some(config) = instances.config(id) else {
                reply(Frame::error(stream, &not_found(id)));
                return;
            };
            let phase = frame.phase.unwrap_or_default();
            let peer = peer.clone();
            tokio::spawn(async move {
                let mut gateway = FramedGateway {
                    peer: peer.clone(),
                    stream: stream.clone(),
                    seq: 0,
                };
                let done = match run_phase(&mut gateway, &config, &phase).await {
                    Ok(()) => Frame::phase_result(stream),
                    Err(e) => Frame::error(stream, &e),
                };
                let _ = peer.out.send(done);
            });
        }
        FrameType::PdkResult => {
            if let Some(tx) = lock(&peer.pending).remove(&(stream, frame.seq)) {
                let outcome = match frame.message {
                    Some(message) => Err(message),
                    None => Ok(frame.payload.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
        }
        FrameType::CloseInstance => {
            let id = frame.instance.unwrap_or_default();
            if instances.close(id) {
                reply(Frame::instance_closed(stream));
            } else {
                reply(Frame::error(stream, &not_found(id)));
            }
        }
        other => reply(Frame::error(stream, &format!("unexpected {:?} frame", other))),
    }
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.dump {
        println!("{}", serde_json::to_string(&describe(&args.protocol))?);
        return Ok(());
    }

    let framed = match args.protocol.as_str() {
        CBOR_RPC_V1 => false,
        CBOR_FRAME_V1 => true,
        other => bail!("unsupported protocol {}", other),
    };
    let socket = args.socket.context("socket path is required unless --dump is given")?;
    let listener = UnixListener::bind(&socket).with_context(|| format!("binding {}", socket.display()))?;
    info!(socket = %socket.display(), protocol = %args.protocol, "Serving {}", PLUGIN_NAME);

    let instances = Arc::new(Instances::default());
    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        if framed {
            tokio::spawn(serve_framed(stream, instances.clone()));
        } else {
            tokio::spawn(serve_legacy(stream, instances.clone()));
        }
    }
}
