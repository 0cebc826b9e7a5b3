pub mod sdp;
pub mod webrtc_peer;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local capture track. Only the negotiator holding it may stop it.
pub trait MediaTrack: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

/// What a media acquisition hands back.
#[derive(Clone, Default)]
pub struct LocalStream {
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tracks.iter().map(|t| (t.id().to_string(), t.kind())))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// States the health monitor treats as a broken media path.
    pub fn is_degraded(self) -> bool {
        matches!(self, IceState::Failed | IceState::Disconnected | IceState::Closed)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationSnapshot {
    pub ice_state: IceState,
    pub signaling_state: SignalingState,
}

impl Default for NegotiationSnapshot {
    fn default() -> Self {
        Self {
            ice_state: IceState::New,
            signaling_state: SignalingState::Stable,
        }
    }
}

/// Raw callbacks from the media engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceStateChanged(IceState),
    SignalingStateChanged(SignalingState),
    RemoteTrack { kind: TrackKind },
}

/// What the negotiator surfaces after interpreting a [`PeerEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    Snapshot(NegotiationSnapshot),
    /// Sent once per session, on the first remote track.
    RemoteStreamAvailable,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError>;
    /// Caps what the video sender may use.
    async fn set_max_video_bitrate(&self, bits_per_second: u32) -> Result<(), MediaError>;
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    /// The applied local description, once candidates are gathered into it.
    async fn local_description(&self) -> Option<SessionDescription> {
        None
    }
    async fn close(&self) -> Result<(), MediaError>;
}

/// Creates peer connections that report back on `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}

/// Local capture (camera + microphone).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream, MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationPhase {
    Fresh,
    OfferSent,
    Stable,
    Closed,
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationPhase::Fresh => "fresh",
            NegotiationPhase::OfferSent => "awaiting answer",
            NegotiationPhase::Stable => "stable",
            NegotiationPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One peer media connection and the local tracks attached to it.
pub struct MediaNegotiator {
    generation: u64,
    peer: Arc<dyn PeerConnection>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    local_tracks: Vec<Arc<dyn MediaTrack>>,
    phase: NegotiationPhase,
    snapshot_tx: watch::Sender<NegotiationSnapshot>,
    remote_announced: bool,
    max_video_bitrate: u32,
}

impl MediaNegotiator {
    pub async fn open(
        connector: &dyn PeerConnector,
        generation: u64,
        max_video_bitrate: u32,
    ) -> Result<Self, MediaError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let peer = connector.connect(events_tx).await?;
        let (snapshot_tx, _) = watch::channel(NegotiationSnapshot::default());
        debug!("Opened media session {}", generation);
        Ok(Self {
            generation,
            peer,
            events,
            local_tracks: Vec::new(),
            phase: NegotiationPhase::Fresh,
            snapshot_tx,
            remote_announced: false,
            max_video_bitrate,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.phase == NegotiationPhase::Closed
    }

    /// Publisher side: attach every local track, cap video, and produce the
    /// local offer.
    pub async fn create_offer(&mut self, stream: LocalStream) -> Result<SessionDescription, MediaError> {
        if let Err(e) = self.expect_phase(NegotiationPhase::Fresh, "create_offer") {
            stream.stop();
            return Err(e);
        }
        if stream.tracks.is_empty() {
            return Err(MediaError::Negotiation("no local tracks to publish".to_string()));
        }

        // close() stops every track of the stream, attached or not.
        let has_video = stream.has_video();
        self.local_tracks.extend(stream.tracks);
        for track in self.local_tracks.clone() {
            self.peer.add_track(track).await?;
        }
        if has_video {
            self.peer.set_max_video_bitrate(self.max_video_bitrate).await?;
        }

        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        let offer = self.peer.local_description().await.unwrap_or(offer);
        self.phase = NegotiationPhase::OfferSent;
        self.update_snapshot(|s| s.signaling_state = SignalingState::HaveLocalOffer);
        info!(
            "Media session {}: local offer set with {} track(s)",
            self.generation,
            self.local_tracks.len()
        );
        Ok(offer)
    }

    pub async fn apply_remote_answer(&mut self, sdp: &str) -> Result<(), MediaError> {
        self.expect_phase(NegotiationPhase::OfferSent, "apply_remote_answer")?;
        self.peer
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.phase = NegotiationPhase::Stable;
        self.update_snapshot(|s| {
            s.signaling_state = SignalingState::Stable;
            if s.ice_state == IceState::New {
                s.ice_state = IceState::Checking;
            }
        });
        info!("Media session {}: remote answer applied", self.generation);
        Ok(())
    }

    /// Viewer side: take the gateway's offer and produce our answer.
    pub async fn accept_remote_offer(&mut self, sdp: &str) -> Result<SessionDescription, MediaError> {
        self.expect_phase(NegotiationPhase::Fresh, "accept_remote_offer")?;
        self.peer
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        let answer = self.peer.local_description().await.unwrap_or(answer);
        self.phase = NegotiationPhase::Stable;
        self.update_snapshot(|s| {
            s.signaling_state = SignalingState::Stable;
            if s.ice_state == IceState::New {
                s.ice_state = IceState::Checking;
            }
        });
        info!("Media session {}: answered remote offer", self.generation);
        Ok(answer)
    }

    pub fn snapshot(&self) -> NegotiationSnapshot {
        *self.snapshot_tx.borrow()
    }

    /// Read-only view of ICE/signaling state; not interpreted here.
    pub fn watch(&self) -> watch::Receiver<NegotiationSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Next raw engine callback. Pending forever once the engine is gone.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    pub fn observe(&mut self, event: PeerEvent) -> Option<NegotiatorEvent> {
        match event {
            PeerEvent::IceStateChanged(state) => {
                debug!("Media session {}: ICE {:?}", self.generation, state);
                self.update_snapshot(|s| s.ice_state = state);
                Some(NegotiatorEvent::Snapshot(self.snapshot()))
            }
            PeerEvent::SignalingStateChanged(state) => {
                self.update_snapshot(|s| s.signaling_state = state);
                Some(NegotiatorEvent::Snapshot(self.snapshot()))
            }
            PeerEvent::RemoteTrack { kind } => {
                debug!("Media session {}: remote {:?} track", self.generation, kind);
                if self.remote_announced {
                    None
                } else {
                    self.remote_announced = true;
                    Some(NegotiatorEvent::RemoteStreamAvailable)
                }
            }
        }
    }

    pub fn local_track_count(&self) -> usize {
        self.local_tracks.len()
    }

    /// Stops and forgets every local track.
    pub fn release_tracks(&mut self) {
        for track in self.local_tracks.drain(..) {
            track.stop();
        }
    }

    /// Releases tracks and closes the peer connection. Safe to call twice.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.release_tracks();
        if let Err(e) = self.peer.close().await {
            warn!("Error closing media session {}: {}", self.generation, e);
        }
        self.phase = NegotiationPhase::Closed;
        self.events.close();
        self.update_snapshot(|s| {
            s.ice_state = IceState::Closed;
            s.signaling_state = SignalingState::Closed;
        });
        info!("Media session {} closed", self.generation);
    }

    fn expect_phase(&self, expected: NegotiationPhase, operation: &'static str) -> Result<(), MediaError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(MediaError::State {
                operation,
                phase: self.phase.to_string(),
            })
        }
    }

    fn update_snapshot(&self, f: impl FnOnce(&mut NegotiationSnapshot)) {
        self.snapshot_tx.send_modify(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeTrack {
        id: String,
        kind: TrackKind,
        stopped: AtomicBool,
    }

    impl FakeTrack {
        fn new(id: &str, kind: TrackKind) -> Arc<Self> {
            Arc::new(Self { id: id.into(), kind, stopped: AtomicBool::new(false) })
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
    struct FakePeer {
        calls: Mutex<Vec<String>>,
        reject_tracks: AtomicBool,
    }

    impl FakePeer {
        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError> {
            self.log(format!("add_track:{}", track.id()));
            if self.reject_tracks.load(Ordering::SeqCst) {
                return Err(MediaError::Engine("track rejected".into()));
            }
            Ok(())
        }
        async fn set_max_video_bitrate(&self, bps: u32) -> Result<(), MediaError> {
            self.log(format!("bitrate:{}", bps));
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
            self.log("create_offer");
            Ok(SessionDescription::offer("v=0 offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
            self.log("create_answer");
            Ok(SessionDescription::answer("v=0 answer"))
        }
        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
            self.log(format!("set_local:{}", desc.kind.as_str()));
            Ok(())
        }
        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
            self.log(format!("set_remote:{}", desc.kind.as_str()));
            Ok(())
        }
        async fn close(&self) -> Result<(), MediaError> {
            self.log("close");
            Ok(())
        }
    }

    struct FakeConnector {
        peer: Arc<FakePeer>,
        events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(
            &self,
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerConnection>, MediaError> {
            *self.events.lock().unwrap() = Some(events);
            Ok(self.peer.clone())
        }
    }

    async fn negotiator() -> (MediaNegotiator, Arc<FakePeer>, FakeConnector) {
        let peer = Arc::new(FakePeer::default());
        let connector = FakeConnector { peer: peer.clone(), events: Mutex::new(None) };
        let negotiator = MediaNegotiator::open(&connector, 1, 1_200_000).await.unwrap();
        (negotiator, peer, connector)
    }

    #[tokio::test]
    async fn answer_before_offer_is_state_error() {
        let (mut negotiator, peer, _c) = negotiator().await;
        let err = negotiator.apply_remote_answer("v=0").await.unwrap_err();
        assert!(matches!(err, MediaError::State { operation: "apply_remote_answer", .. }));
        assert!(peer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offer_then_answer_moves_forward() {
        let (mut negotiator, peer, _c) = negotiator().await;
        let video = FakeTrack::new("cam", TrackKind::Video);
        let audio = FakeTrack::new("mic", TrackKind::Audio);
        let stream = LocalStream::new(vec![video.clone(), audio.clone()]);

        let offer = negotiator.create_offer(stream).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert_eq!(negotiator.snapshot().signaling_state, SignalingState::HaveLocalOffer);

        negotiator.apply_remote_answer("v=0 answer").await.unwrap();
        let snapshot = negotiator.snapshot();
        assert_eq!(snapshot.signaling_state, SignalingState::Stable);
        assert_eq!(snapshot.ice_state, IceState::Checking);

        assert_eq!(
            *peer.calls.lock().unwrap(),
            vec![
                "add_track:cam",
                "add_track:mic",
                "bitrate:1200000",
                "create_offer",
                "set_local:offer",
                "set_remote:answer",
            ]
        );

        // A second answer for the same offer is out of order.
        assert!(negotiator.apply_remote_answer("v=0").await.is_err());
    }

    #[tokio::test]
    async fn offer_without_tracks_fails() {
        let (mut negotiator, _peer, _c) = negotiator().await;
        let err = negotiator.create_offer(LocalStream::default()).await.unwrap_err();
        assert!(matches!(err, MediaError::Negotiation(_)));
    }

    #[tokio::test]
    async fn audio_only_offer_skips_bitrate_cap() {
        let (mut negotiator, peer, _c) = negotiator().await;
        let stream = LocalStream::new(vec![FakeTrack::new("mic", TrackKind::Audio)]);
        negotiator.create_offer(stream).await.unwrap();
        assert!(!peer.calls.lock().unwrap().iter().any(|c| c.starts_with("bitrate")));
    }

    #[tokio::test]
    async fn viewer_answers_remote_offer() {
        let (mut negotiator, peer, _c) = negotiator().await;
        let answer = negotiator.accept_remote_offer("v=0 offer").await.unwrap();
        assert_eq!(answer, SessionDescription::answer("v=0 answer"));
        assert_eq!(
            *peer.calls.lock().unwrap(),
            vec!["set_remote:offer", "create_answer", "set_local:answer"]
        );
        assert!(negotiator.accept_remote_offer("v=0 offer").await.is_err());
    }

    #[tokio::test]
    async fn remote_stream_is_announced_once() {
        let (mut negotiator, _peer, connector) = negotiator().await;
        let events = connector.events.lock().unwrap().clone().unwrap();
        events.send(PeerEvent::RemoteTrack { kind: TrackKind::Video }).unwrap();
        events.send(PeerEvent::RemoteTrack { kind: TrackKind::Audio }).unwrap();
        events.send(PeerEvent::IceStateChanged(IceState::Connected)).unwrap();

        let mut announced = 0;
        for _ in 0..3 {
            let event = negotiator.next_event().await.unwrap();
            if negotiator.observe(event) == Some(NegotiatorEvent::RemoteStreamAvailable) {
                announced += 1;
            }
        }
        assert_eq!(announced, 1);
        assert_eq!(negotiator.snapshot().ice_state, IceState::Connected);
    }

    #[tokio::test]
    async fn close_stops_tracks_once() {
        let (mut negotiator, peer, _c) = negotiator().await;
        let video = FakeTrack::new("cam", TrackKind::Video);
        negotiator
            .create_offer(LocalStream::new(vec![video.clone()]))
            .await
            .unwrap();
        let watcher = negotiator.watch();

        negotiator.close().await;
        negotiator.close().await;

        assert!(video.stopped.load(Ordering::SeqCst));
        assert_eq!(negotiator.local_track_count(), 0);
        assert_eq!(watcher.borrow().ice_state, IceState::Closed);
        let closes = peer.calls.lock().unwrap().iter().filter(|c| *c == "close").count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn failed_attach_still_releases_every_track() {
        let (mut negotiator, peer, _c) = negotiator().await;
        peer.reject_tracks.store(true, Ordering::SeqCst);
        let video = FakeTrack::new("cam", TrackKind::Video);
        let audio = FakeTrack::new("mic", TrackKind::Audio);

        let err = negotiator
            .create_offer(LocalStream::new(vec![video.clone(), audio.clone()]))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Engine(_)));
        assert_eq!(negotiator.local_track_count(), 2);

        negotiator.close().await;
        assert!(video.stopped.load(Ordering::SeqCst));
        assert!(audio.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn offer_on_closed_session_stops_the_stream() {
        let (mut negotiator, _peer, _c) = negotiator().await;
        negotiator.close().await;
        assert!(negotiator.is_closed());

        let video = FakeTrack::new("cam", TrackKind::Video);
        let err = negotiator
            .create_offer(LocalStream::new(vec![video.clone()]))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::State { operation: "create_offer", .. }));
        assert!(video.stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn stream_debug_lists_tracks() {
        let stream = LocalStream::new(vec![FakeTrack::new("cam", TrackKind::Video)]);
        assert_eq!(format!("{:?}", stream), r#"[("cam", Video)]"#);
    }
}
