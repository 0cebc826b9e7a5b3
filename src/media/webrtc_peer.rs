//! `webrtc`-crate implementation of the peer traits.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as WrtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::sdp::cap_video_bandwidth;
use super::{
    IceState, LocalStream, MediaDevices, MediaTrack, PeerConnection, PeerConnector, PeerEvent,
    SdpKind, SessionDescription, SignalingState, TrackKind,
};
use crate::config::LiveConfig;
use crate::error::MediaError;

/// Upper bound on waiting for host/srflx candidates before sending SDP.
const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Engine(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::Engine(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::Engine(format!("Failed to create peer connection: {}", e)))?,
        );

        let ice_tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            info!("ICE connection state: {}", state);
            if let Some(state) = ice_state(state) {
                let _ = ice_tx.send(PeerEvent::IceStateChanged(state));
            }
            Box::pin(async {})
        }));

        let signaling_tx = events.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            debug!("Signaling state: {}", state);
            if let Some(state) = signaling_state(state) {
                let _ = signaling_tx.send(PeerEvent::SignalingStateChanged(state));
            }
            Box::pin(async {})
        }));

        let track_tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            info!("Received remote {:?} track", kind);
            let _ = track_tx.send(PeerEvent::RemoteTrack { kind });
            Box::pin(async {})
        }));

        info!("Created WebRTC peer connection");
        Ok(Arc::new(WebRtcPeer {
            pc,
            video_cap_kbps: Mutex::new(None),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    video_cap_kbps: Mutex<Option<u32>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError> {
        let sample = track
            .as_any()
            .downcast_ref::<SampleTrack>()
            .ok_or_else(|| MediaError::Engine(format!("track {} is not a sample track", track.id())))?;

        let rtp_sender = self
            .pc
            .add_track(sample.inner.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to add track: {}", e)))?;

        // RTCP has to be drained for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn set_max_video_bitrate(&self, bits_per_second: u32) -> Result<(), MediaError> {
        *self.video_cap_kbps.lock().await = Some((bits_per_second / 1000).max(1));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = to_rtc(desc)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to set local description: {}", e)))?;
        if tokio::time::timeout(GATHER_TIMEOUT, gathered.recv()).await.is_err() {
            warn!("ICE gathering did not complete in {:?}", GATHER_TIMEOUT);
        }
        Ok(())
    }

    async fn set_remote_description(&self, mut desc: SessionDescription) -> Result<(), MediaError> {
        // The answerer's bandwidth line bounds what our video sender may use.
        if desc.kind == SdpKind::Answer {
            if let Some(kbps) = *self.video_cap_kbps.lock().await {
                desc.sdp = cap_video_bandwidth(&desc.sdp, kbps);
            }
        }
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        let kind = match desc.sdp_type {
            RTCSdpType::Answer => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        Some(SessionDescription { kind, sdp: desc.sdp })
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc
            .close()
            .await
            .map_err(|e| MediaError::Engine(format!("Failed to close peer connection: {}", e)))
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| MediaError::Negotiation(format!("Invalid {} SDP: {}", desc.kind.as_str(), e)))
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    Some(match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    })
}

fn signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => return None,
    })
}

/// A local track fed with encoded samples by a capture pipeline.
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    inner: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl SampleTrack {
    fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind_label(kind), Uuid::new_v4());
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let inner = Arc::new(TrackLocalStaticSample::new(codec, id.clone(), stream_id.to_string()));
        Self {
            id,
            kind,
            inner,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Writes one encoded frame. Dropped silently once the track is stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.inner
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::Engine(format!("Failed to write sample: {}", e)))
    }
}

impl MediaTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stopped local track {}", self.id);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

/// Hands out VP8/Opus sample tracks. Every acquisition is published on
/// [`SampleTrackSource::tracks`] so the capture pipeline can feed it.
pub struct SampleTrackSource {
    stream_id: String,
    audio: bool,
    video: bool,
    tracks_tx: watch::Sender<Vec<Arc<SampleTrack>>>,
}

impl SampleTrackSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        let (tracks_tx, _) = watch::channel(Vec::new());
        Self {
            stream_id: stream_id.into(),
            audio: true,
            video: true,
            tracks_tx,
        }
    }

    pub fn with_audio(mut self, enabled: bool) -> Self {
        self.audio = enabled;
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video = enabled;
        self
    }

    pub fn tracks(&self) -> watch::Receiver<Vec<Arc<SampleTrack>>> {
        self.tracks_tx.subscribe()
    }
}

#[async_trait]
impl MediaDevices for SampleTrackSource {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if !self.audio && !self.video {
            return Err(MediaError::PermissionDenied(
                "no capture device is enabled".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if self.video {
            tracks.push(Arc::new(SampleTrack::new(TrackKind::Video, &self.stream_id)));
        }
        if self.audio {
            tracks.push(Arc::new(SampleTrack::new(TrackKind::Audio, &self.stream_id)));
        }
        self.tracks_tx.send_replace(tracks.clone());
        info!("Acquired {} local track(s) for {}", tracks.len(), self.stream_id);

        Ok(LocalStream::new(
            tracks.into_iter().map(|t| t as Arc<dyn MediaTrack>).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_publishes_acquired_tracks() {
        let source = SampleTrackSource::new("clinic-live");
        let feed = source.tracks();

        let stream = source.acquire().await.unwrap();
        assert_eq!(stream.tracks.len(), 2);
        assert!(stream.has_video());
        assert_eq!(feed.borrow().len(), 2);

        stream.tracks[0].stop();
        let fed = feed.borrow()[0].clone();
        assert!(fed.is_stopped());
        // Writes after stop are no-ops.
        fed.write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(33))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_devices_deny_permission() {
        let source = SampleTrackSource::new("s").with_audio(false).with_video(false);
        let err = source.acquire().await.unwrap_err();
        assert!(matches!(err, MediaError::PermissionDenied(_)));
    }

    #[test]
    fn engine_states_map_across() {
        assert_eq!(ice_state(RTCIceConnectionState::Failed), Some(IceState::Failed));
        assert_eq!(ice_state(RTCIceConnectionState::Unspecified), None);
        assert_eq!(
            signaling_state(RTCSignalingState::HaveLocalOffer),
            Some(SignalingState::HaveLocalOffer)
        );
    }
}
