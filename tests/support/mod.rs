//! In-memory stand-ins for the hub, capture devices and the peer engine.

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clinic_live::error::{HubError, MediaError};
use clinic_live::hub::{HubConnectionManager, HubTransport, TransportEvent};
use clinic_live::media::{
    IceState, LocalStream, MediaDevices, MediaTrack, PeerConnection, PeerConnector, PeerEvent,
    SessionDescription, TrackKind,
};
use clinic_live::session::{RoomSessionController, RoomSessionHandle, Session, SessionPhase};
use clinic_live::LiveConfig;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub method: String,
    pub args: Vec<Value>,
}

/// Hub transport driven by the test: records invocations and lets the test
/// push events as if the hub had sent them.
#[derive(Default)]
pub struct FakeTransport {
    pub opens: AtomicUsize,
    feed: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    invocations: Mutex<Vec<Invocation>>,
    failing: Mutex<HashSet<String>>,
    drop_on: Mutex<HashSet<String>>,
    pub subscriptions: Mutex<Vec<Vec<String>>>,
}

impl FakeTransport {
    pub fn push(&self, event: TransportEvent) {
        if let Some(tx) = self.feed.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn emit(&self, name: &str, args: Vec<Value>) {
        self.push(TransportEvent::Event {
            name: name.to_string(),
            args,
        });
    }

    pub fn fail(&self, method: &str) {
        self.failing.lock().unwrap().insert(method.to_string());
    }

    /// The next call to `method` loses the link before failing.
    pub fn drop_link_on(&self, method: &str) {
        self.drop_on.lock().unwrap().insert(method.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn calls(&self, method: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.method == method)
            .collect()
    }
}

#[async_trait]
impl HubTransport for FakeTransport {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, HubError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        self.invocations.lock().unwrap().push(Invocation {
            method: method.to_string(),
            args,
        });
        if self.drop_on.lock().unwrap().remove(method) {
            self.push(TransportEvent::Closed {
                error: Some("link lost".into()),
            });
            self.feed.lock().unwrap().take();
            settle().await;
            return Err(HubError::invoke(method, "connection lost"));
        }
        if self.failing.lock().unwrap().contains(method) {
            return Err(HubError::invoke(method, "rejected by hub"));
        }
        Ok(Value::Null)
    }

    async fn subscribe(&self, events: Vec<String>) -> Result<(), HubError> {
        self.subscriptions.lock().unwrap().push(events);
        Ok(())
    }

    async fn close(&self) -> Result<(), HubError> {
        self.feed.lock().unwrap().take();
        Ok(())
    }
}

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub deny: AtomicBool,
    pub acquired: Mutex<Vec<Arc<FakeTrack>>>,
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera blocked".into()));
        }
        let mut acquired = self.acquired.lock().unwrap();
        let n = acquired.len();
        let tracks = vec![
            Arc::new(FakeTrack {
                id: format!("cam-{}", n),
                kind: TrackKind::Video,
                stopped: AtomicBool::new(false),
            }),
            Arc::new(FakeTrack {
                id: format!("mic-{}", n),
                kind: TrackKind::Audio,
                stopped: AtomicBool::new(false),
            }),
        ];
        acquired.extend(tracks.iter().cloned());
        Ok(LocalStream::new(
            tracks.into_iter().map(|t| t as Arc<dyn MediaTrack>).collect(),
        ))
    }
}

#[derive(Default)]
pub struct FakePeer {
    pub calls: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl FakePeer {
    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError> {
        self.log(format!("add_track:{}", track.id()));
        Ok(())
    }

    async fn set_max_video_bitrate(&self, bits_per_second: u32) -> Result<(), MediaError> {
        self.log(format!("bitrate:{}", bits_per_second));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.log("create_offer".into());
        Ok(SessionDescription::offer("v=0 offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.log("create_answer".into());
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.log(format!("set_local:{}", desc.kind.as_str()));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.log(format!("set_remote:{}:{}", desc.kind.as_str(), desc.sdp));
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`FakePeer`]s and keeps their event senders so tests can play
/// engine callbacks.
#[derive(Default)]
pub struct FakeConnector {
    pub peers: Mutex<Vec<(Arc<FakePeer>, mpsc::UnboundedSender<PeerEvent>)>>,
}

impl FakeConnector {
    pub fn count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock().unwrap()[index].0.clone()
    }

    pub fn latest(&self) -> Arc<FakePeer> {
        self.peers.lock().unwrap().last().unwrap().0.clone()
    }

    pub fn fire(&self, event: PeerEvent) {
        let peers = self.peers.lock().unwrap();
        let (_, tx) = peers.last().unwrap();
        let _ = tx.send(event);
    }

    pub fn set_ice(&self, state: IceState) {
        self.fire(PeerEvent::IceStateChanged(state));
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let peer = Arc::new(FakePeer::default());
        self.peers.lock().unwrap().push((peer.clone(), events));
        Ok(peer)
    }
}

pub struct Harness {
    pub handle: RoomSessionHandle,
    pub hub: HubConnectionManager,
    pub transport: Arc<FakeTransport>,
    pub devices: Arc<FakeDevices>,
    pub connector: Arc<FakeConnector>,
}

impl Harness {
    pub fn new(session: Session) -> Self {
        Self::with_config(session, LiveConfig::default())
    }

    pub fn with_config(session: Session, config: LiveConfig) -> Self {
        let transport = Arc::new(FakeTransport::default());
        let hub = HubConnectionManager::new(transport.clone());
        let devices = Arc::new(FakeDevices::default());
        let connector = Arc::new(FakeConnector::default());
        let handle = RoomSessionController::builder(session, hub.clone())
            .config(config)
            .media_devices(devices.clone())
            .peer_connector(connector.clone())
            .spawn();
        Self {
            handle,
            hub,
            transport,
            devices,
            connector,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.handle.snapshot().phase
    }

    /// Waits until the controller reports `phase`.
    pub async fn reach(&self, phase: SessionPhase) {
        let mut rx = self.handle.watch();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|snapshot| snapshot.phase == phase),
        )
        .await;
        let reached = matches!(result, Ok(Ok(_)));
        drop(result);
        assert!(
            reached,
            "never reached {:?}, stuck at {:?}",
            phase,
            self.phase()
        );
    }
}

/// Lets spawned tasks and the controller drain their queues.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
