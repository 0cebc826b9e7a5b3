//! Lifecycle of the persistent signaling connection.
//!
//! [`HubConnectionManager`] is a cheap, cloneable handle. The session
//! controller owns connect/disconnect; everything else only reads the state
//! and calls [`HubConnectionManager::invoke`].

pub mod ws;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::protocol::HubCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a transport reports after it has been opened.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Event { name: String, args: Vec<Value> },
    /// The link dropped and the transport is retrying.
    Reconnecting,
    /// A retry succeeded; server-side subscriptions are gone.
    Reconnected,
    /// The transport gave up, or was closed on request (`error: None`).
    Closed { error: Option<String> },
}

/// The wire underneath the manager. Reconnection after a transient drop is
/// the transport's job.
#[async_trait]
pub trait HubTransport: Send + Sync + 'static {
    /// Establishes the link and completes the handshake.
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, HubError>;

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError>;

    /// Asks the hub to deliver the named events on this link.
    async fn subscribe(&self, events: Vec<String>) -> Result<(), HubError>;

    async fn close(&self) -> Result<(), HubError>;
}

pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Inner {
    transport: Arc<dyn HubTransport>,
    /// One handler per event name; registering again replaces it.
    handlers: Mutex<HashMap<String, EventHandler>>,
    state_handler: Mutex<Option<StateHandler>>,
    state_tx: watch::Sender<ConnectionState>,
    connect_lock: TokioMutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct HubConnectionManager {
    inner: Arc<Inner>,
}

impl HubConnectionManager {
    pub fn new(transport: Arc<dyn HubTransport>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                handlers: Mutex::new(HashMap::new()),
                state_handler: Mutex::new(None),
                state_tx,
                connect_lock: TokioMutex::new(()),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Opens the transport. While another connect is in progress this waits
    /// for it and reports its outcome instead of opening a second link.
    pub async fn connect(&self) -> Result<ConnectionState, HubError> {
        let was_connecting = self.state() == ConnectionState::Connecting;
        let _guard = self.inner.connect_lock.lock().await;

        let current = self.state();
        if was_connecting {
            return match current {
                ConnectionState::Failed | ConnectionState::Disconnected => Err(HubError::Connect(
                    format!("concurrent connect attempt ended {}", current),
                )),
                other => Ok(other),
            };
        }
        if matches!(current, ConnectionState::Connected | ConnectionState::Reconnecting) {
            return Ok(current);
        }

        self.inner.set_state(ConnectionState::Connecting);
        let events = match self.inner.transport.open().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Hub connect failed: {}", e);
                self.inner.set_state(ConnectionState::Failed);
                return Err(e);
            }
        };

        self.inner.rearm().await;

        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(pump_events(weak, events));
        if let Some(old) = self.inner.pump.lock().unwrap_or_else(|p| p.into_inner()).replace(pump) {
            old.abort();
        }

        self.inner.set_state(ConnectionState::Connected);
        info!("Hub connected");
        Ok(ConnectionState::Connected)
    }

    /// Sends a command. Fails immediately unless the hub is connected.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(HubError::invoke(method, format!("hub is {}", state)));
        }
        debug!("Invoking {}", method);
        self.inner.transport.invoke(method, args).await
    }

    pub async fn send(&self, command: &HubCommand) -> Result<Value, HubError> {
        self.invoke(command.method(), command.args()).await
    }

    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let mut handlers = self.inner.handlers.lock().unwrap_or_else(|p| p.into_inner());
        if handlers.insert(event.to_string(), Arc::new(handler)).is_some() {
            debug!("Replaced handler for {}", event);
        }
    }

    pub fn off(&self, event: &str) {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(event);
    }

    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        *self.inner.state_handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(handler));
    }

    /// Closes the link. Safe to call repeatedly; transport errors while
    /// closing are logged, never returned.
    pub async fn disconnect(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        let pump = self.inner.pump.lock().unwrap_or_else(|p| p.into_inner()).take();
        if pump.is_none() && self.state() == ConnectionState::Disconnected {
            return;
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Err(e) = self.inner.transport.close().await {
            warn!("Error while closing hub transport: {}", e);
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!("Hub disconnected");
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if !changed {
            return;
        }
        debug!("Hub state -> {}", next);
        let handler = self
            .state_handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(next);
        }
    }

    fn dispatch(&self, name: &str, args: &[Value]) {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned();
        match handler {
            Some(handler) => handler(args),
            None => debug!("No handler for hub event {}", name),
        }
    }

    /// Re-subscribes every registered event on the transport.
    async fn rearm(&self) {
        let names: Vec<String> = self
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        if names.is_empty() {
            return;
        }
        if let Err(e) = self.transport.subscribe(names).await {
            warn!("Failed to re-arm hub event handlers: {}", e);
        }
    }
}

async fn pump_events(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event {
            TransportEvent::Event { name, args } => inner.dispatch(&name, &args),
            TransportEvent::Reconnecting => {
                info!("Hub reconnecting");
                inner.set_state(ConnectionState::Reconnecting);
            }
            TransportEvent::Reconnected => {
                // Handlers must be in place before anything else is delivered.
                inner.rearm().await;
                info!("Hub reconnected");
                inner.set_state(ConnectionState::Connected);
            }
            TransportEvent::Closed { error } => {
                match error {
                    Some(reason) => {
                        warn!("Hub connection closed: {}", reason);
                        inner.set_state(ConnectionState::Failed);
                    }
                    None => inner.set_state(ConnectionState::Disconnected),
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Transport whose inbound side is driven by the test.
    #[derive(Default)]
    struct ScriptedTransport {
        opens: AtomicUsize,
        fail_open: std::sync::atomic::AtomicBool,
        fail_close: std::sync::atomic::AtomicBool,
        feed: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
        subscriptions: Mutex<Vec<Vec<String>>>,
        invoked: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn push(&self, event: TransportEvent) {
            if let Some(tx) = self.feed.lock().unwrap().as_ref() {
                tx.send(event).unwrap();
            }
        }
    }

    #[async_trait]
    impl HubTransport for ScriptedTransport {
        async fn open(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, HubError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(HubError::Connect("handshake refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.feed.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn invoke(&self, method: &str, _args: Vec<Value>) -> Result<Value, HubError> {
            self.invoked.lock().unwrap().push(method.to_string());
            Ok(Value::Null)
        }

        async fn subscribe(&self, events: Vec<String>) -> Result<(), HubError> {
            let mut events = events;
            events.sort();
            self.subscriptions.lock().unwrap().push(events);
            Ok(())
        }

        async fn close(&self) -> Result<(), HubError> {
            self.feed.lock().unwrap().take();
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(HubError::Closed);
            }
            Ok(())
        }
    }

    fn manager() -> (HubConnectionManager, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::default());
        (HubConnectionManager::new(transport.clone()), transport)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_connects_open_once() {
        let (hub, transport) = manager();
        let (a, b) = tokio::join!(hub.connect(), hub.connect());
        assert_eq!(a.unwrap(), ConnectionState::Connected);
        assert_eq!(b.unwrap(), ConnectionState::Connected);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);

        assert_eq!(hub.connect().await.unwrap(), ConnectionState::Connected);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_handshake_reports_connect_error() {
        let (hub, transport) = manager();
        transport.fail_open.store(true, Ordering::SeqCst);
        let err = hub.connect().await.unwrap_err();
        assert!(matches!(err, HubError::Connect(_)));
        assert_eq!(hub.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn invoke_is_rejected_while_disconnected() {
        let (hub, transport) = manager();
        let err = hub.invoke("keepAlive", vec![]).await.unwrap_err();
        assert!(matches!(err, HubError::Invoke { .. }));
        assert!(transport.invoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_registering_replaces_handler() {
        let (hub, transport) = manager();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        hub.on("messageReceived", move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        hub.on("messageReceived", move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        hub.connect().await.unwrap();
        transport.push(TransportEvent::Event {
            name: "messageReceived".into(),
            args: vec![],
        });
        settle().await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        hub.off("messageReceived");
        transport.push(TransportEvent::Event {
            name: "messageReceived".into(),
            args: vec![],
        });
        settle().await;
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_rearms_handlers_before_reporting_connected() {
        let (hub, transport) = manager();
        hub.on("sessionEnded", |_| {});
        hub.on("roomJoined", |_| {});

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        hub.on_state_change(move |state| s.lock().unwrap().push(state));

        hub.connect().await.unwrap();
        assert_eq!(transport.subscriptions.lock().unwrap().len(), 1);

        transport.push(TransportEvent::Reconnecting);
        transport.push(TransportEvent::Reconnected);
        settle().await;

        let subs = transport.subscriptions.lock().unwrap().clone();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1], vec!["roomJoined".to_string(), "sessionEnded".to_string()]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn transport_giving_up_marks_failed() {
        let (hub, transport) = manager();
        hub.connect().await.unwrap();
        transport.push(TransportEvent::Closed {
            error: Some("reconnect attempts exhausted".into()),
        });
        settle().await;
        assert_eq!(hub.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_swallows_close_errors() {
        let (hub, transport) = manager();
        hub.connect().await.unwrap();
        transport.fail_close.store(true, Ordering::SeqCst);

        hub.disconnect().await;
        assert_eq!(hub.state(), ConnectionState::Disconnected);
        hub.disconnect().await;
        assert_eq!(hub.state(), ConnectionState::Disconnected);
    }
}
