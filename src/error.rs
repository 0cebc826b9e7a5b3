use thiserror::Error;

use crate::session::SessionPhase;

/// Failures of the signaling hub connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// Transport unreachable or the initial handshake never completed.
    #[error("failed to connect to hub: {0}")]
    Connect(String),

    /// Command rejected by the hub, or sent while not connected.
    #[error("invoke {method} failed: {reason}")]
    Invoke { method: String, reason: String },

    /// The hub sent a frame we could not make sense of.
    #[error("hub protocol error: {0}")]
    Protocol(String),

    #[error("hub connection closed")]
    Closed,
}

impl HubError {
    pub fn invoke(method: &str, reason: impl Into<String>) -> Self {
        HubError::Invoke {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures while acquiring media or negotiating a peer connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// An operation was called out of order.
    #[error("{operation} is not valid while negotiation is {phase}")]
    State { operation: &'static str, phase: String },

    #[error("media engine error: {0}")]
    Engine(String),
}

/// Failures of the REST collaborators.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Errors returned by [`crate::RoomSessionHandle`] commands.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("{command} is not allowed while {phase}")]
    NotAllowed {
        command: &'static str,
        phase: SessionPhase,
    },

    #[error("only the host can start publishing")]
    HostOnly,

    #[error("no room has been joined yet")]
    NoRoom,

    #[error("unknown reaction kind {0}")]
    UnknownReaction(u8),

    #[error("session controller has shut down")]
    ControllerGone,
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
