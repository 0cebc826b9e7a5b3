//! WebSocket transport speaking the hub's JSON framing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{HubTransport, TransportEvent};
use crate::config::LiveConfig;
use crate::error::HubError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PROTOCOL_VERSION: u32 = 1;
const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Handshake {
        protocol: &'static str,
        version: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
    },
    Invocation {
        invocation_id: u64,
        target: String,
        arguments: Vec<Value>,
    },
    Subscribe {
        events: Vec<String>,
    },
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    HandshakeAck,
    Completion {
        invocation_id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        target: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    Ping,
    Close {
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Clone)]
struct DialConfig {
    url: String,
    access_token: Option<String>,
    handshake_timeout: Duration,
    reconnect_delays: Vec<Duration>,
}

type PendingReply = oneshot::Sender<Result<Value, HubError>>;

#[derive(Default)]
struct Shared {
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_id: AtomicU64,
    closing: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn outbound(&self) -> Option<mpsc::UnboundedSender<ClientFrame>> {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<ClientFrame>>) {
        *self.outbound.lock().unwrap_or_else(|p| p.into_inner()) = tx;
    }

    fn complete(&self, id: u64, outcome: Result<Value, HubError>) {
        let reply = self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
        match reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => debug!("Completion for unknown invocation {}", id),
        }
    }

    /// Pending invocations cannot complete once the socket is gone.
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        for (_, reply) in drained {
            let _ = reply.send(Err(HubError::invoke("pending", reason)));
        }
    }
}

pub struct WsHubTransport {
    dial: DialConfig,
    shared: Arc<Shared>,
}

impl WsHubTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = LiveConfig::default();
        Self {
            dial: DialConfig {
                url: url.into(),
                access_token: None,
                handshake_timeout: defaults.handshake_timeout(),
                reconnect_delays: defaults.reconnect_delays(),
            },
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(config.hub_url.clone())
            .with_access_token(config.access_token.clone())
            .with_handshake_timeout(config.handshake_timeout())
            .with_reconnect_delays(config.reconnect_delays())
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.dial.access_token = token;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.dial.handshake_timeout = timeout;
        self
    }

    pub fn with_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.dial.reconnect_delays = delays;
        self
    }
}

#[async_trait]
impl HubTransport for WsHubTransport {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, HubError> {
        self.shared.closing.store(false, Ordering::SeqCst);
        let socket = dial(&self.dial).await?;
        info!("Hub websocket connected to {}", self.dial.url);

        // Outbound must be usable as soon as open() returns, before the
        // supervisor task gets polled.
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        self.shared.set_outbound(Some(frames_tx));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(
            socket,
            frames_rx,
            self.dial.clone(),
            self.shared.clone(),
            events_tx,
        ));
        let previous = self
            .shared
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(supervisor);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(events_rx)
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        let outbound = self
            .shared
            .outbound()
            .ok_or_else(|| HubError::invoke(method, "socket is not open"))?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, reply_tx);

        let frame = ClientFrame::Invocation {
            invocation_id: id,
            target: method.to_string(),
            arguments: args,
        };
        if outbound.send(frame).is_err() {
            self.shared.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
            return Err(HubError::invoke(method, "socket closed while sending"));
        }

        match tokio::time::timeout(INVOKE_TIMEOUT, reply_rx).await {
            Ok(Ok(outcome)) => outcome.map_err(|e| match e {
                HubError::Invoke { reason, .. } => HubError::invoke(method, reason),
                other => other,
            }),
            Ok(Err(_)) => Err(HubError::invoke(method, "connection lost")),
            Err(_) => {
                self.shared.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
                Err(HubError::invoke(method, "timed out waiting for completion"))
            }
        }
    }

    async fn subscribe(&self, events: Vec<String>) -> Result<(), HubError> {
        let outbound = self.shared.outbound().ok_or(HubError::Closed)?;
        outbound
            .send(ClientFrame::Subscribe { events })
            .map_err(|_| HubError::Closed)
    }

    async fn close(&self) -> Result<(), HubError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let outbound = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if outbound.is_none() {
            // Between sockets (or never opened): nothing will notice the flag soon.
            if let Some(supervisor) = self
                .shared
                .supervisor
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
            {
                supervisor.abort();
            }
            self.shared.fail_pending("transport closed");
        }
        Ok(())
    }
}

async fn dial(cfg: &DialConfig) -> Result<WsStream, HubError> {
    tokio::time::timeout(cfg.handshake_timeout, handshake(cfg))
        .await
        .map_err(|_| HubError::Connect("handshake timed out".to_string()))?
}

async fn handshake(cfg: &DialConfig) -> Result<WsStream, HubError> {
    let (mut socket, _) = connect_async(cfg.url.as_str())
        .await
        .map_err(|e| HubError::Connect(format!("websocket connect failed: {}", e)))?;

    let hello = ClientFrame::Handshake {
        protocol: "json",
        version: PROTOCOL_VERSION,
        access_token: cfg.access_token.clone(),
    };
    let text = serde_json::to_string(&hello).map_err(|e| HubError::Protocol(e.to_string()))?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| HubError::Connect(format!("handshake send failed: {}", e)))?;

    while let Some(msg) = socket.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::HandshakeAck) => return Ok(socket),
                Ok(ServerFrame::Close { error }) => {
                    return Err(HubError::Connect(
                        error.unwrap_or_else(|| "hub refused handshake".to_string()),
                    ))
                }
                _ => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(HubError::Connect(format!("handshake failed: {}", e))),
        }
    }
    Err(HubError::Connect("socket closed during handshake".to_string()))
}

/// Owns the socket for its whole life, including automatic reconnects.
async fn supervise(
    mut socket: WsStream,
    mut frames_rx: mpsc::UnboundedReceiver<ClientFrame>,
    cfg: DialConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let reason = run_socket(socket, frames_rx, &shared, &events).await;
        shared.set_outbound(None);
        shared.fail_pending("connection lost");

        if shared.closing.load(Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Closed { error: None });
            return;
        }

        warn!("Hub websocket lost: {}", reason);
        let _ = events.send(TransportEvent::Reconnecting);

        match redial(&cfg, &shared).await {
            Some(next) => {
                socket = next;
                let (frames_tx, next_rx) = mpsc::unbounded_channel();
                shared.set_outbound(Some(frames_tx));
                frames_rx = next_rx;
                let _ = events.send(TransportEvent::Reconnected);
            }
            None => {
                let error = if shared.closing.load(Ordering::SeqCst) {
                    None
                } else {
                    Some("reconnect attempts exhausted".to_string())
                };
                let _ = events.send(TransportEvent::Closed { error });
                return;
            }
        }
    }
}

async fn redial(cfg: &DialConfig, shared: &Shared) -> Option<WsStream> {
    for (attempt, delay) in cfg.reconnect_delays.iter().enumerate() {
        tokio::time::sleep(*delay).await;
        if shared.closing.load(Ordering::SeqCst) {
            return None;
        }
        match dial(cfg).await {
            Ok(socket) => {
                info!("Hub websocket reconnected after {} attempt(s)", attempt + 1);
                return Some(socket);
            }
            Err(e) => debug!("Reconnect attempt {} failed: {}", attempt + 1, e),
        }
    }
    None
}

/// Pumps one socket until it ends; returns why it ended.
async fn run_socket(
    socket: WsStream,
    mut frames: mpsc::UnboundedReceiver<ClientFrame>,
    shared: &Shared,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> String {
    let (mut write, mut read) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    let _ = write.send(Message::Close(None)).await;
                    return "closed by client".to_string();
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize hub frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    return format!("write failed: {}", e);
                }
            }
            _ = ping.tick() => {
                if let Ok(text) = serde_json::to_string(&ClientFrame::Ping) {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        return format!("ping failed: {}", e);
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Completion { invocation_id, result, error }) => {
                            let outcome = match error {
                                Some(reason) => Err(HubError::invoke("completion", reason)),
                                None => Ok(result.unwrap_or(Value::Null)),
                            };
                            shared.complete(invocation_id, outcome);
                        }
                        Ok(ServerFrame::Event { target, arguments }) => {
                            let _ = events.send(TransportEvent::Event { name: target, args: arguments });
                        }
                        Ok(ServerFrame::Close { error }) => {
                            return error.unwrap_or_else(|| "closed by hub".to_string());
                        }
                        Ok(ServerFrame::Ping) | Ok(ServerFrame::HandshakeAck) => {}
                        Err(e) => debug!("Ignoring unparseable hub frame: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return "pong failed".to_string();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return "socket closed".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("read failed: {}", e),
                }
            }
        }
    }
}
