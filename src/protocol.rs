//! Typed view of the livestream hub's commands and events.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::chat::ChatMessage;
use crate::error::HubError;

/// Inbound hub event names, in the order handlers are registered.
pub const EVENT_NAMES: [&str; 8] = [
    ROOM_JOINED,
    ROOM_CREATED,
    PUBLISH_STARTED,
    VIEWER_COUNT_CHANGED,
    MESSAGE_RECEIVED,
    REACTION_RECEIVED,
    SESSION_ENDED,
    SIGNALING_ERROR,
];

pub const ROOM_JOINED: &str = "roomJoined";
pub const ROOM_CREATED: &str = "roomCreated";
pub const PUBLISH_STARTED: &str = "publishStarted";
pub const VIEWER_COUNT_CHANGED: &str = "viewerCountChanged";
pub const MESSAGE_RECEIVED: &str = "messageReceived";
pub const REACTION_RECEIVED: &str = "reactionReceived";
pub const SESSION_ENDED: &str = "sessionEnded";
pub const SIGNALING_ERROR: &str = "signalingError";

/// Commands sent to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HubCommand {
    JoinAsViewer { room_id: String },
    CreateRoom,
    StartPublish { room_id: String, sdp_type: String, sdp: String },
    SendAnswer { room_id: String, session_id: i64, handle_id: Option<i64>, sdp: String },
    SendMessage { room_id: String, text: String },
    SendReaction { room_id: String, kind: u8 },
    KeepAlive { session_id: i64 },
    EndSession { room_id: String },
}

impl HubCommand {
    pub fn method(&self) -> &'static str {
        match self {
            HubCommand::JoinAsViewer { .. } => "joinAsViewer",
            HubCommand::CreateRoom => "createRoom",
            HubCommand::StartPublish { .. } => "startPublish",
            HubCommand::SendAnswer { .. } => "sendAnswer",
            HubCommand::SendMessage { .. } => "sendMessage",
            HubCommand::SendReaction { .. } => "sendReaction",
            HubCommand::KeepAlive { .. } => "keepAlive",
            HubCommand::EndSession { .. } => "endSession",
        }
    }

    /// Positional invocation arguments.
    pub fn args(&self) -> Vec<Value> {
        match self {
            HubCommand::JoinAsViewer { room_id } => vec![json!(room_id)],
            HubCommand::CreateRoom => vec![],
            HubCommand::StartPublish { room_id, sdp_type, sdp } => {
                vec![json!(room_id), json!(sdp_type), json!(sdp)]
            }
            HubCommand::SendAnswer { room_id, session_id, handle_id, sdp } => {
                vec![json!(room_id), json!(session_id), json!(handle_id), json!(sdp)]
            }
            HubCommand::SendMessage { room_id, text } => vec![json!(room_id), json!(text)],
            HubCommand::SendReaction { room_id, kind } => vec![json!(room_id), json!(kind)],
            HubCommand::KeepAlive { session_id } => vec![json!(session_id)],
            HubCommand::EndSession { room_id } => vec![json!(room_id)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub session_id: i64,
    pub media_room_id: i64,
    #[serde(default)]
    pub handle_id: Option<i64>,
    #[serde(default)]
    pub offer_sdp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub room_guid: String,
    pub media_room_id: i64,
    pub session_id: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishStarted {
    pub session_id: i64,
    pub answer_sdp: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionReceived {
    pub kind: u8,
}

/// Events pushed by the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    RoomJoined(RoomJoined),
    RoomCreated(RoomCreated),
    PublishStarted(PublishStarted),
    ViewerCountChanged(u32),
    MessageReceived(ChatMessage),
    ReactionReceived(u8),
    SessionEnded,
    SignalingError(String),
}

impl HubEvent {
    /// Decodes an event from its name and positional arguments.
    pub fn parse(name: &str, args: &[Value]) -> Result<Self, HubError> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        let event = match name {
            ROOM_JOINED => HubEvent::RoomJoined(decode(name, first)?),
            ROOM_CREATED => HubEvent::RoomCreated(decode(name, first)?),
            PUBLISH_STARTED => HubEvent::PublishStarted(decode(name, first)?),
            VIEWER_COUNT_CHANGED => HubEvent::ViewerCountChanged(decode(name, first)?),
            MESSAGE_RECEIVED => HubEvent::MessageReceived(decode(name, first)?),
            REACTION_RECEIVED => {
                // Sent either as a bare number or as {"kind": n}.
                let kind = match first {
                    Value::Number(_) => decode(name, first)?,
                    other => decode::<ReactionReceived>(name, other)?.kind,
                };
                HubEvent::ReactionReceived(kind)
            }
            SESSION_ENDED => HubEvent::SessionEnded,
            SIGNALING_ERROR => HubEvent::SignalingError(match first {
                Value::String(s) => s,
                Value::Null => "unknown signaling error".to_string(),
                other => other.to_string(),
            }),
            other => return Err(HubError::Protocol(format!("unknown event {}", other))),
        };
        Ok(event)
    }
}

fn decode<T: serde::de::DeserializeOwned>(name: &str, value: Value) -> Result<T, HubError> {
    serde_json::from_value(value)
        .map_err(|e| HubError::Protocol(format!("malformed {} payload: {}", name, e)))
}

/// Reads a numeric session id out of an invoke result, if the hub returned one.
pub fn session_id_from_result(result: &Value) -> Option<i64> {
    result
        .as_i64()
        .or_else(|| result.get("sessionId").and_then(Value::as_i64))
}
