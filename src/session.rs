//! The room session controller.
//!
//! One actor task owns every piece of session state: the phase machine,
//! the current room, the media session, chat and reactions. Hub events,
//! connection changes, peer callbacks, keepalive and health reports, and
//! reaction expiries are all funnelled into its `select!` loop, so they are
//! handled one at a time and in arrival order. [`RoomSessionHandle`] is the
//! cloneable front door.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::chat::{ChatMessage, EventDeduplicator};
use crate::config::LiveConfig;
use crate::directory::{RoomDirectory, RoomMetadata};
use crate::error::{Result, SessionError};
use crate::health::{ConnectionHealthMonitor, HealthPolicy, HealthSample, HealthVerdict};
use crate::hub::{ConnectionState, HubConnectionManager};
use crate::keepalive::{KeepAliveScheduler, KeepAliveTicket, ReconnectRequest};
use crate::media::webrtc_peer::{SampleTrackSource, WebRtcConnector};
use crate::media::{
    MediaDevices, MediaNegotiator, NegotiationSnapshot, NegotiatorEvent, PeerConnector, PeerEvent,
};
use crate::protocol::{self, HubCommand, HubEvent, PublishStarted, RoomCreated, RoomJoined, EVENT_NAMES};
use crate::reactions::{reaction_style, ActiveReaction, ReactionScheduler};
use crate::timer::PeriodicTask;

/// Older chat lines fall off the log past this many.
const CHAT_LOG_LIMIT: usize = 200;
const UPDATE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Viewer,
}

/// Who is taking part and where. Fixed for the controller's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub role: Role,
    pub participant_id: String,
    pub clinic_id: String,
    /// Room to join directly. Hosts without one create a room.
    #[serde(default)]
    pub room_scope: Option<String>,
}

impl Session {
    pub fn host(participant_id: impl Into<String>, clinic_id: impl Into<String>) -> Self {
        Self {
            role: Role::Host,
            participant_id: participant_id.into(),
            clinic_id: clinic_id.into(),
            room_scope: None,
        }
    }

    pub fn viewer(
        participant_id: impl Into<String>,
        clinic_id: impl Into<String>,
        room_id: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Viewer,
            participant_id: participant_id.into(),
            clinic_id: clinic_id.into(),
            room_scope: Some(room_id.into()),
        }
    }

    pub fn in_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_scope = Some(room_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub media_room_id: Option<i64>,
    pub display: Option<RoomMetadata>,
}

impl Room {
    fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            media_room_id: None,
            display: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Connecting,
    AwaitingRoom,
    RoomReady,
    Publishing,
    Viewing,
    Ended { reason: String },
    Error { reason: String },
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Ended { .. } | SessionPhase::Error { .. })
    }

    /// Media is flowing (or being re-established) in this phase.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionPhase::Publishing | SessionPhase::Viewing)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => f.write_str("idle"),
            SessionPhase::Connecting => f.write_str("connecting"),
            SessionPhase::AwaitingRoom => f.write_str("awaiting room"),
            SessionPhase::RoomReady => f.write_str("room ready"),
            SessionPhase::Publishing => f.write_str("publishing"),
            SessionPhase::Viewing => f.write_str("viewing"),
            SessionPhase::Ended { reason } => write!(f, "ended ({})", reason),
            SessionPhase::Error { reason } => write!(f, "error: {}", reason),
        }
    }
}

/// Everything a UI needs to render the stage, emitted as one value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub connection: ConnectionState,
    pub room: Option<Room>,
    pub viewer_count: u32,
    pub messages: Vec<ChatMessage>,
    pub reactions: Vec<ActiveReaction>,
    /// Last non-fatal problem worth showing once.
    pub notice: Option<String>,
    pub remote_stream: bool,
    pub recovering: bool,
    pub media: Option<NegotiationSnapshot>,
}

impl SessionSnapshot {
    fn initial(connection: ConnectionState) -> Self {
        Self {
            phase: SessionPhase::Idle,
            connection,
            room: None,
            viewer_count: 0,
            messages: Vec::new(),
            reactions: Vec::new(),
            notice: None,
            remote_stream: false,
            recovering: false,
            media: None,
        }
    }
}

type Reply = oneshot::Sender<Result<()>>;

enum Command {
    Start(Reply),
    StartPublishing(Reply),
    SendChat { text: String, reply: Reply },
    SendReaction { kind: u8, reply: Reply },
    EndSession(Reply),
    Retry(Reply),
}

enum Internal {
    Hub(HubEvent),
    Connection(ConnectionState),
    Metadata { room_id: String, metadata: RoomMetadata },
}

/// Cloneable handle to a running controller. Dropping every clone stops
/// the controller and closes the hub connection.
#[derive(Clone)]
pub struct RoomSessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    updates_tx: broadcast::Sender<SessionSnapshot>,
}

impl RoomSessionHandle {
    /// Connects and sets up the room. Only acts from `Idle`.
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await
    }

    pub async fn start_publishing(&self) -> Result<()> {
        self.request(Command::StartPublishing).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendChat { text, reply }).await
    }

    pub async fn send_reaction(&self, kind: u8) -> Result<()> {
        self.request(|reply| Command::SendReaction { kind, reply }).await
    }

    pub async fn end_session(&self) -> Result<()> {
        self.request(Command::EndSession).await
    }

    /// From `Error` or `Ended`, resets to `Idle` and starts over.
    pub async fn retry(&self) -> Result<()> {
        self.request(Command::Retry).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Latest snapshot only.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Every snapshot emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.updates_tx.subscribe()
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)?
    }
}

pub struct ControllerBuilder {
    session: Session,
    hub: HubConnectionManager,
    config: LiveConfig,
    devices: Option<Arc<dyn MediaDevices>>,
    connector: Option<Arc<dyn PeerConnector>>,
    directory: Option<Arc<dyn RoomDirectory>>,
}

impl ControllerBuilder {
    pub fn config(mut self, config: LiveConfig) -> Self {
        self.config = config;
        self
    }

    pub fn media_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn peer_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn RoomDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Starts the controller task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> RoomSessionHandle {
        let ControllerBuilder {
            session,
            hub,
            config,
            devices,
            connector,
            directory,
        } = self;

        let devices = devices
            .unwrap_or_else(|| Arc::new(SampleTrackSource::new(session.participant_id.clone())));
        let connector =
            connector.unwrap_or_else(|| Arc::new(WebRtcConnector::from_config(&config)));

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (health_tx, health) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnects) = mpsc::unbounded_channel();
        let (expiry_tx, expiries) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::initial(hub.state()));
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER);

        register_hub_handlers(&hub, &internal_tx);

        let controller = RoomSessionController {
            dedup: EventDeduplicator::new(config.dedup_window),
            reactions: ReactionScheduler::new(config.reaction_ttl(), expiry_tx),
            policy: HealthPolicy::new(config.max_rejoin_attempts),
            session,
            config,
            hub,
            devices,
            connector,
            directory,
            phase: SessionPhase::Idle,
            room: None,
            handle_id: None,
            join_attempted: false,
            media: None,
            generation: 0,
            active: false,
            session_token: None,
            keepalive: None,
            health_task: None,
            pending_rejoin: false,
            room_deadline: None,
            messages: Vec::new(),
            viewer_count: 0,
            notice: None,
            remote_stream: false,
            snapshot_tx,
            updates_tx: updates_tx.clone(),
            internal_tx,
            health_tx,
            reconnect_tx,
        };
        let inbox = Inbox {
            commands,
            internal,
            health,
            reconnects,
            expiries,
        };
        tokio::spawn(controller.run(inbox));

        RoomSessionHandle {
            commands: command_tx,
            snapshot_rx,
            updates_tx,
        }
    }
}

/// Every hub event is parsed on the pump task and queued for the actor.
fn register_hub_handlers(hub: &HubConnectionManager, internal_tx: &mpsc::UnboundedSender<Internal>) {
    for name in EVENT_NAMES {
        let tx = internal_tx.clone();
        hub.on(name, move |args| match HubEvent::parse(name, args) {
            Ok(event) => {
                let _ = tx.send(Internal::Hub(event));
            }
            Err(e) => warn!("Dropping hub event: {}", e),
        });
    }
    let tx = internal_tx.clone();
    hub.on_state_change(move |state| {
        let _ = tx.send(Internal::Connection(state));
    });
}

struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    internal: mpsc::UnboundedReceiver<Internal>,
    health: mpsc::UnboundedReceiver<HealthSample>,
    reconnects: mpsc::UnboundedReceiver<ReconnectRequest>,
    expiries: mpsc::UnboundedReceiver<String>,
}

pub struct RoomSessionController {
    session: Session,
    config: LiveConfig,
    hub: HubConnectionManager,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    directory: Option<Arc<dyn RoomDirectory>>,

    phase: SessionPhase,
    room: Option<Room>,
    handle_id: Option<i64>,
    /// Set once room creation or joining has been attempted.
    join_attempted: bool,

    media: Option<MediaNegotiator>,
    generation: u64,
    /// True while `media` is live; cleared before any teardown.
    active: bool,
    /// Latest session token from the hub; pinged only while media is live.
    session_token: Option<i64>,
    keepalive: Option<KeepAliveTicket>,
    health_task: Option<PeriodicTask>,
    policy: HealthPolicy,
    /// A rejoin is waiting for the hub to come back.
    pending_rejoin: bool,
    room_deadline: Option<Instant>,

    dedup: EventDeduplicator,
    reactions: ReactionScheduler,
    messages: Vec<ChatMessage>,
    viewer_count: u32,
    notice: Option<String>,
    remote_stream: bool,

    snapshot_tx: watch::Sender<SessionSnapshot>,
    updates_tx: broadcast::Sender<SessionSnapshot>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    health_tx: mpsc::UnboundedSender<HealthSample>,
    reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
}

impl RoomSessionController {
    pub fn builder(session: Session, hub: HubConnectionManager) -> ControllerBuilder {
        ControllerBuilder {
            session,
            hub,
            config: LiveConfig::default(),
            devices: None,
            connector: None,
            directory: None,
        }
    }

    async fn run(mut self, mut inbox: Inbox) {
        info!(
            "Session controller started for {} as {:?}",
            self.session.participant_id, self.session.role
        );

        loop {
            let deadline = self.room_deadline;
            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(internal) = inbox.internal.recv() => self.handle_internal(internal).await,
                event = next_peer_event(&mut self.media) => self.handle_peer_event(event),
                Some(sample) = inbox.health.recv() => self.handle_health(sample).await,
                Some(request) = inbox.reconnects.recv() => self.handle_reconnect(request).await,
                Some(key) = inbox.expiries.recv() => {
                    if self.reactions.expire(&key) {
                        debug!("Reaction {} expired", key);
                    }
                }
                _ = sleep_until(deadline) => self.handle_room_timeout().await,
            }
            self.emit();
        }

        self.teardown().await;
        for name in EVENT_NAMES {
            self.hub.off(name);
        }
        self.hub.disconnect().await;
        info!("Session controller for {} stopped", self.session.participant_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::StartPublishing(reply) => {
                let result = self.start_publishing().await;
                let _ = reply.send(result);
            }
            Command::SendChat { text, reply } => {
                let result = self.send_chat(text).await;
                let _ = reply.send(result);
            }
            Command::SendReaction { kind, reply } => {
                let result = self.send_reaction(kind).await;
                let _ = reply.send(result);
            }
            Command::EndSession(reply) => {
                let result = self.end_session().await;
                let _ = reply.send(result);
            }
            Command::Retry(reply) => {
                let result = self.retry().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        if self.phase != SessionPhase::Idle {
            debug!("Ignoring start while {}", self.phase);
            return Ok(());
        }
        self.set_phase(SessionPhase::Connecting);

        match self.hub.connect().await {
            Ok(ConnectionState::Connected) => self.on_hub_connected().await,
            Ok(state) => {
                debug!("Hub is {}, room setup waits for it", state);
                Ok(())
            }
            Err(e) => {
                self.set_phase(SessionPhase::Error { reason: e.to_string() });
                Err(e.into())
            }
        }
    }

    async fn start_publishing(&mut self) -> Result<()> {
        if self.session.role != Role::Host {
            return Err(SessionError::HostOnly);
        }
        if self.phase != SessionPhase::RoomReady {
            return Err(SessionError::NotAllowed {
                command: "start_publishing",
                phase: self.phase.clone(),
            });
        }
        if let Err(e) = self.publish().await {
            // The room stays usable; the host may try again.
            warn!("Publishing failed: {}", e);
            self.notice = Some(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    async fn send_chat(&mut self, text: String) -> Result<()> {
        let room_id = self.room_id().ok_or(SessionError::NoRoom)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.hub
            .send(&HubCommand::SendMessage {
                room_id,
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn send_reaction(&mut self, kind: u8) -> Result<()> {
        if reaction_style(kind).is_none() {
            return Err(SessionError::UnknownReaction(kind));
        }
        let room_id = self.room_id().ok_or(SessionError::NoRoom)?;
        self.hub.send(&HubCommand::SendReaction { room_id, kind }).await?;
        Ok(())
    }

    async fn end_session(&mut self) -> Result<()> {
        if matches!(self.phase, SessionPhase::Idle) || self.phase.is_terminal() {
            return Ok(());
        }
        // Any rejoin or health report still queued must see this first.
        self.active = false;
        self.policy.reset();
        self.pending_rejoin = false;

        let reason = match self.session.role {
            Role::Host => {
                if let Some(room_id) = self.room_id() {
                    if let Err(e) = self.hub.send(&HubCommand::EndSession { room_id }).await {
                        warn!("endSession was not acknowledged, cleaning up locally: {}", e);
                    }
                }
                "stream ended"
            }
            Role::Viewer => "left the stream",
        };
        self.finish(reason).await;
        Ok(())
    }

    async fn retry(&mut self) -> Result<()> {
        if !self.phase.is_terminal() {
            return Err(SessionError::NotAllowed {
                command: "retry",
                phase: self.phase.clone(),
            });
        }
        info!("Retrying session from {}", self.phase);
        self.teardown().await;
        self.policy.reset();
        self.pending_rejoin = false;
        self.join_attempted = false;
        self.notice = None;
        self.viewer_count = 0;
        self.messages.clear();
        self.dedup.clear();
        self.set_phase(SessionPhase::Idle);
        self.start().await
    }

    /// Runs once per controller lifetime (again only after `retry`).
    async fn on_hub_connected(&mut self) -> Result<()> {
        if self.join_attempted {
            return Ok(());
        }
        self.join_attempted = true;

        match (self.session.role, self.session.room_scope.clone()) {
            (role, Some(room_id)) => {
                self.room = Some(Room::new(room_id.clone()));
                self.fetch_metadata(&room_id);
                self.set_phase(SessionPhase::RoomReady);
                if role == Role::Viewer {
                    self.setup_invoke(HubCommand::JoinAsViewer { room_id }).await?;
                }
                Ok(())
            }
            (Role::Host, None) => {
                self.set_phase(SessionPhase::AwaitingRoom);
                self.setup_invoke(HubCommand::CreateRoom).await
            }
            (Role::Viewer, None) => {
                self.set_phase(SessionPhase::Error {
                    reason: "no room to join".to_string(),
                });
                Err(SessionError::NoRoom)
            }
        }
    }

    /// A room-setup invoke. Failure leaves the session in `Error`.
    async fn setup_invoke(&mut self, command: HubCommand) -> Result<()> {
        match self.hub.send(&command).await {
            Ok(_) => {
                self.room_deadline = Some(Instant::now() + self.config.room_setup_timeout());
                Ok(())
            }
            Err(e) => {
                warn!("{} failed: {}", command.method(), e);
                self.teardown().await;
                self.set_phase(SessionPhase::Error { reason: e.to_string() });
                Err(e.into())
            }
        }
    }

    fn fetch_metadata(&self, room_id: &str) {
        let Some(directory) = self.directory.clone() else {
            return;
        };
        let tx = self.internal_tx.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            match directory.room_metadata(&room_id).await {
                Ok(metadata) => {
                    let _ = tx.send(Internal::Metadata { room_id, metadata });
                }
                Err(e) => warn!("Could not load metadata for room {}: {}", room_id, e),
            }
        });
    }

    async fn handle_room_timeout(&mut self) {
        self.room_deadline = None;
        if self.policy.is_rejoining() {
            self.fail_rejoin("timed out waiting for the room").await;
            return;
        }
        if matches!(self.phase, SessionPhase::AwaitingRoom | SessionPhase::RoomReady) {
            warn!("No room event within {:?}", self.config.room_setup_timeout());
            self.teardown().await;
            self.set_phase(SessionPhase::Error {
                reason: "timed out waiting for room".to_string(),
            });
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Hub(event) => self.handle_hub_event(event).await,
            Internal::Connection(state) => self.on_connection_state(state).await,
            Internal::Metadata { room_id, metadata } => {
                if let Some(room) = self.room.as_mut().filter(|r| r.room_id == room_id) {
                    room.display = Some(metadata);
                }
            }
        }
    }

    async fn handle_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::RoomCreated(created) => self.on_room_created(created),
            HubEvent::RoomJoined(joined) => self.on_room_joined(joined).await,
            HubEvent::PublishStarted(started) => self.on_publish_started(started).await,
            HubEvent::ViewerCountChanged(count) => self.viewer_count = count,
            HubEvent::MessageReceived(message) => {
                if !self.dedup.admit(&message) {
                    debug!("Dropping duplicate chat message");
                    return;
                }
                self.messages.push(message);
                if self.messages.len() > CHAT_LOG_LIMIT {
                    let excess = self.messages.len() - CHAT_LOG_LIMIT;
                    self.messages.drain(..excess);
                }
            }
            HubEvent::ReactionReceived(kind) => {
                self.reactions.spawn(kind);
            }
            HubEvent::SessionEnded => {
                if !self.phase.is_terminal() && self.phase != SessionPhase::Idle {
                    info!("Hub reports the session has ended");
                    self.active = false;
                    self.finish("the stream has ended").await;
                }
            }
            HubEvent::SignalingError(message) => {
                warn!("Signaling error from hub: {}", message);
                self.notice = Some(message);
            }
        }
    }

    fn on_room_created(&mut self, created: RoomCreated) {
        if self.phase != SessionPhase::AwaitingRoom {
            debug!("Ignoring roomCreated while {}", self.phase);
            return;
        }
        info!("Room {} created", created.room_guid);
        self.room_deadline = None;
        self.room = Some(Room {
            room_id: created.room_guid.clone(),
            media_room_id: Some(created.media_room_id),
            display: None,
        });
        self.session_token = Some(created.session_id);
        self.fetch_metadata(&created.room_guid);
        self.set_phase(SessionPhase::RoomReady);
    }

    async fn on_room_joined(&mut self, joined: RoomJoined) {
        let expected = matches!(self.phase, SessionPhase::AwaitingRoom | SessionPhase::RoomReady)
            || (self.policy.is_rejoining() && self.phase.is_live());
        if !expected {
            debug!("Ignoring roomJoined while {}", self.phase);
            return;
        }
        let Some(room) = self.room.as_mut() else {
            warn!("roomJoined arrived without a room");
            return;
        };
        info!("Joined room {}", room.room_id);
        room.media_room_id = Some(joined.media_room_id);
        // A rejoin is only done once new media is installed.
        if !self.policy.is_rejoining() {
            self.room_deadline = None;
        }
        self.handle_id = joined.handle_id;
        self.session_token = Some(joined.session_id);
        if self.phase == SessionPhase::AwaitingRoom {
            self.set_phase(SessionPhase::RoomReady);
        }

        if self.session.role == Role::Viewer {
            match joined.offer_sdp {
                Some(sdp) => self.answer_offer(joined.session_id, sdp).await,
                None if self.policy.is_rejoining() => {
                    debug!("Rejoined without an offer; room deadline still running")
                }
                None => debug!("Joined without an offer; waiting"),
            }
        }
    }

    async fn on_publish_started(&mut self, started: PublishStarted) {
        if self.phase != SessionPhase::Publishing {
            debug!("Ignoring publishStarted while {}", self.phase);
            return;
        }
        let Some(media) = self.media.as_mut() else {
            debug!("Ignoring publishStarted without a media session");
            return;
        };
        match media.apply_remote_answer(&started.answer_sdp).await {
            Ok(()) => {
                info!("Publishing confirmed for session {}", started.session_id);
                self.session_token = Some(started.session_id);
                self.sync_keepalive();
                if self.policy.is_rejoining() {
                    self.room_deadline = None;
                    self.policy.finish_rejoin();
                }
            }
            Err(e) => self.media_failed(e.into()).await,
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        debug!("Hub connection {}", state);
        if state != ConnectionState::Connected {
            return;
        }
        if self.phase == SessionPhase::Connecting && !self.join_attempted {
            if let Err(e) = self.on_hub_connected().await {
                warn!("Room setup failed: {}", e);
            }
        }
        if self.pending_rejoin {
            info!("Hub is back, running deferred rejoin");
            self.rejoin().await;
        }
    }

    async fn handle_reconnect(&mut self, request: ReconnectRequest) {
        if self.phase.is_terminal() || self.phase == SessionPhase::Idle {
            return;
        }
        match self.hub.state() {
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting => {
                debug!("Reconnect for {} not needed: hub {}", request.session_id, self.hub.state());
            }
            state => {
                info!("Reconnecting signaling after keepalive failure (hub {})", state);
                if let Err(e) = self.hub.connect().await {
                    warn!("Signaling reconnect failed: {}", e);
                    self.notice = Some(e.to_string());
                }
            }
        }
    }

    /// Acquires local media, offers it, and asks the hub to publish.
    async fn publish(&mut self) -> Result<()> {
        let room_id = self.room_id().ok_or(SessionError::NoRoom)?;
        let stream = self.devices.acquire().await?;

        let mut media = match MediaNegotiator::open(
            self.connector.as_ref(),
            self.generation + 1,
            self.config.max_video_bitrate_bps,
        )
        .await
        {
            Ok(media) => media,
            Err(e) => {
                stream.stop();
                return Err(e.into());
            }
        };

        let offer = match media.create_offer(stream).await {
            Ok(offer) => offer,
            Err(e) => {
                media.close().await;
                return Err(e.into());
            }
        };

        let command = HubCommand::StartPublish {
            room_id,
            sdp_type: offer.kind.as_str().to_string(),
            sdp: offer.sdp,
        };
        let result = match self.hub.send(&command).await {
            Ok(result) => result,
            Err(e) => {
                media.close().await;
                return Err(e.into());
            }
        };
        if let Some(session_id) = protocol::session_id_from_result(&result) {
            self.session_token = Some(session_id);
        }

        self.install_media(media);
        self.set_phase(SessionPhase::Publishing);
        Ok(())
    }

    async fn answer_offer(&mut self, session_id: i64, offer_sdp: String) {
        let Some(room_id) = self.room_id() else {
            return;
        };

        let mut media = match MediaNegotiator::open(
            self.connector.as_ref(),
            self.generation + 1,
            self.config.max_video_bitrate_bps,
        )
        .await
        {
            Ok(media) => media,
            Err(e) => return self.media_failed(e.into()).await,
        };

        let answer = match media.accept_remote_offer(&offer_sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                media.close().await;
                return self.media_failed(e.into()).await;
            }
        };

        let command = HubCommand::SendAnswer {
            room_id,
            session_id,
            handle_id: self.handle_id,
            sdp: answer.sdp,
        };
        if let Err(e) = self.hub.send(&command).await {
            media.close().await;
            return self.media_failed(e.into()).await;
        }

        self.install_media(media);
        if self.policy.is_rejoining() {
            info!("Rejoin complete");
            self.room_deadline = None;
            self.policy.finish_rejoin();
        }
        self.set_phase(SessionPhase::Viewing);
    }

    fn install_media(&mut self, media: MediaNegotiator) {
        self.generation = media.generation();
        self.health_task = Some(ConnectionHealthMonitor::spawn(
            self.generation,
            media.watch(),
            self.config.health_interval(),
            self.health_tx.clone(),
        ));
        self.media = Some(media);
        self.active = true;
        self.remote_stream = false;
        self.sync_keepalive();
    }

    async fn media_failed(&mut self, error: SessionError) {
        if self.policy.is_rejoining() {
            self.fail_rejoin(error.to_string()).await;
            return;
        }
        warn!("Media negotiation failed: {}", error);
        self.teardown().await;
        self.set_phase(SessionPhase::Error {
            reason: error.to_string(),
        });
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(media) = self.media.as_mut() else {
            return;
        };
        match media.observe(event) {
            Some(NegotiatorEvent::RemoteStreamAvailable) => {
                info!("Remote stream available");
                self.remote_stream = true;
            }
            Some(NegotiatorEvent::Snapshot(snapshot)) => {
                if snapshot.ice_state.is_connected() {
                    self.policy.mark_connected();
                }
            }
            None => {}
        }
    }

    async fn handle_health(&mut self, sample: HealthSample) {
        if !self.active || sample.generation != self.generation {
            debug!("Discarding health sample from media session {}", sample.generation);
            return;
        }
        match self.policy.assess(sample.ice_state) {
            HealthVerdict::Healthy | HealthVerdict::InFlight => {}
            HealthVerdict::GiveUp => {
                warn!("Media connection did not recover, ending session");
                self.finish("media connection lost").await;
            }
            HealthVerdict::Rejoin { attempt } => {
                info!("Media degraded ({:?}), rejoin attempt {}", sample.ice_state, attempt);
                self.begin_rejoin().await;
            }
        }
    }

    async fn begin_rejoin(&mut self) {
        self.active = false;
        self.health_task = None;
        self.sync_keepalive();
        if let Some(mut media) = self.media.take() {
            media.close().await;
        }
        self.remote_stream = false;

        if self.hub.is_connected() {
            self.rejoin().await;
        } else {
            info!("Deferring rejoin until the hub reconnects");
            self.pending_rejoin = true;
        }
    }

    async fn rejoin(&mut self) {
        self.pending_rejoin = false;
        let Some(room_id) = self.room_id() else {
            self.fail_rejoin("no room").await;
            return;
        };
        let result = match self.session.role {
            Role::Viewer => self
                .hub
                .send(&HubCommand::JoinAsViewer { room_id })
                .await
                .map(|_| ())
                .map_err(SessionError::from),
            Role::Host => self.publish().await,
        };
        match result {
            Ok(()) => {
                self.room_deadline = Some(Instant::now() + self.config.room_setup_timeout());
            }
            Err(e) => self.fail_rejoin(e.to_string()).await,
        }
    }

    async fn fail_rejoin(&mut self, reason: impl fmt::Display) {
        warn!("Rejoin failed: {}", reason);
        self.finish(format!("rejoin failed: {}", reason)).await;
    }

    async fn finish(&mut self, reason: impl Into<String>) {
        self.policy.reset();
        self.pending_rejoin = false;
        self.teardown().await;
        self.set_phase(SessionPhase::Ended {
            reason: reason.into(),
        });
    }

    /// Releases everything tied to the current room. Safe to repeat.
    async fn teardown(&mut self) {
        self.active = false;
        self.room_deadline = None;
        self.keepalive = None;
        self.session_token = None;
        self.health_task = None;
        if let Some(mut media) = self.media.take() {
            media.close().await;
        }
        self.remote_stream = false;
        self.handle_id = None;
        self.room = None;
        self.reactions.clear();
    }

    /// Runs the keepalive only while media is live and a token is known,
    /// re-arming when the token changes.
    fn sync_keepalive(&mut self) {
        let Some(session_id) = self.session_token.filter(|_| self.active) else {
            if self.keepalive.take().is_some() {
                debug!("Keepalive stopped");
            }
            return;
        };
        if self.keepalive.as_ref().map(KeepAliveTicket::session_id) == Some(session_id) {
            return;
        }
        debug!("Keepalive armed for session {}", session_id);
        self.keepalive = Some(KeepAliveScheduler::spawn(
            self.hub.clone(),
            session_id,
            self.config.keepalive_interval(),
            self.reconnect_tx.clone(),
        ));
    }

    fn room_id(&self) -> Option<String> {
        self.room.as_ref().map(|r| r.room_id.clone())
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            info!("Session {} -> {}", self.phase, phase);
            self.phase = phase;
        }
        self.emit();
    }

    fn build_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase.clone(),
            connection: self.hub.state(),
            room: self.room.clone(),
            viewer_count: self.viewer_count,
            messages: self.messages.clone(),
            reactions: self.reactions.active().to_vec(),
            notice: self.notice.clone(),
            remote_stream: self.remote_stream,
            recovering: self.policy.is_rejoining(),
            media: self.media.as_ref().map(MediaNegotiator::snapshot),
        }
    }

    /// Publishes the snapshot if anything changed since the last one.
    fn emit(&self) {
        let snapshot = self.build_snapshot();
        let changed = self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot.clone();
                true
            }
        });
        if changed {
            let _ = self.updates_tx.send(snapshot);
        }
    }
}

async fn next_peer_event(media: &mut Option<MediaNegotiator>) -> PeerEvent {
    match media {
        Some(media) => match media.next_event().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phase_serializes_with_tag() {
        assert_eq!(serde_json::to_value(SessionPhase::RoomReady).unwrap(), json!({"phase": "roomReady"}));
        assert_eq!(
            serde_json::to_value(SessionPhase::Ended { reason: "done".into() }).unwrap(),
            json!({"phase": "ended", "reason": "done"})
        );
    }

    #[test]
    fn terminal_phases() {
        assert!(SessionPhase::Error { reason: "x".into() }.is_terminal());
        assert!(SessionPhase::Ended { reason: "x".into() }.is_terminal());
        assert!(!SessionPhase::Publishing.is_terminal());
        assert_eq!(SessionPhase::AwaitingRoom.to_string(), "awaiting room");
    }

    #[test]
    fn viewer_session_carries_room() {
        let session = Session::viewer("p1", "c1", "room-9");
        assert_eq!(session.role, Role::Viewer);
        assert_eq!(session.room_scope.as_deref(), Some("room-9"));
        assert_eq!(Session::host("h", "c").in_room("r").room_scope.as_deref(), Some("r"));
    }
}
