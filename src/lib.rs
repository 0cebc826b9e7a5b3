pub mod chat;
pub mod config;
pub mod directory;
pub mod error;
pub mod health;
pub mod hub;
pub mod keepalive;
pub mod media;
pub mod protocol;
pub mod reactions;
pub mod session;
pub mod timer;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub use crate::chat::{ChatMessage, EventDeduplicator};
pub use crate::config::LiveConfig;
pub use crate::directory::{HttpRoomDirectory, RoomDirectory};
pub use crate::error::{DirectoryError, HubError, MediaError, SessionError};
pub use crate::hub::ws::WsHubTransport;
pub use crate::hub::{ConnectionState, HubConnectionManager, HubTransport};
pub use crate::media::MediaNegotiator;
pub use crate::reactions::ReactionScheduler;
pub use crate::session::{
    Role, RoomSessionController, RoomSessionHandle, Session, SessionPhase, SessionSnapshot,
};

/// Installs the fmt subscriber. `RUST_LOG` overrides the default level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wires a controller to the WebSocket hub, the REST directory and the
/// webrtc media backend described by `config`.
pub fn spawn_session(config: &LiveConfig, session: Session) -> RoomSessionHandle {
    let transport = Arc::new(WsHubTransport::from_config(config));
    let hub = HubConnectionManager::new(transport);
    RoomSessionController::builder(session, hub)
        .config(config.clone())
        .directory(Arc::new(HttpRoomDirectory::from_config(config)))
        .spawn()
}

/// Runs one session without a UI until it ends or the process is
/// interrupted. Hosts start publishing as soon as their room is ready.
pub async fn run_headless(config: LiveConfig, session: Session) -> Result<SessionPhase, SessionError> {
    let role = session.role;
    let handle = spawn_session(&config, session);
    let mut updates = handle.watch();
    let mut published = false;

    handle.start().await?;
    info!("Running in headless mode as {:?}", role);

    loop {
        let snapshot = updates.borrow_and_update().clone();
        info!(
            phase = %snapshot.phase,
            connection = %snapshot.connection,
            viewers = snapshot.viewer_count,
            "Session update"
        );
        if let Some(notice) = &snapshot.notice {
            warn!("{}", notice);
        }
        if snapshot.phase.is_terminal() {
            return Ok(snapshot.phase);
        }
        if role == Role::Host && snapshot.phase == SessionPhase::RoomReady && !published {
            published = true;
            if let Err(e) = handle.start_publishing().await {
                warn!("Could not start publishing: {}", e);
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Err(SessionError::ControllerGone);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, ending session");
                handle.end_session().await?;
                return Ok(handle.snapshot().phase);
            }
        }
    }
}
