use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub type SessionId = String;
pub type RoomId = String;

// ---------- Event names ----------

pub mod events {
    pub const JOIN: &str = "join";
    pub const LEAVE_ROOM: &str = "leave-room";
    pub const SEND_MESSAGE: &str = "send-message";
    pub const MOVE: &str = "move";
    pub const WEBRTC_OFFER: &str = "webrtc-offer";
    pub const WEBRTC_ANSWER: &str = "webrtc-answer";
    pub const WEBRTC_CANDIDATE: &str = "webrtc-candidate";

    pub const USER_JOINED: &str = "user-joined";
    pub const USER_JOINING_FAILED: &str = "user-joining-failed";
    pub const USER_LEFT: &str = "user-left";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_SENT: &str = "message-sent";
    pub const MOVEMENT: &str = "movement";
    pub const MOVE_COMPLETED: &str = "move-completed";
    pub const ERROR: &str = "error";
}

// ---------- Envelopes ----------

/// Inbound frame: `{ "type": ..., "data": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound frame: `{ "type": ..., "success": ..., "data"?: ..., "error"?: ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerEnvelope {
    /// A payload that fails to serialize turns the envelope into a failure
    /// carrying the encoding error.
    pub fn ok(event_type: impl Into<String>, data: impl Serialize) -> Self {
        let event_type = event_type.into();
        match serde_json::to_value(data) {
            Ok(data) => Self {
                event_type,
                success: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::encoding_failure(event_type, e),
        }
    }

    pub fn failure(event_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Failure that still carries a payload, e.g. a rejected move echoing the old position.
    pub fn rejected(
        event_type: impl Into<String>,
        data: impl Serialize,
        error: impl Into<String>,
    ) -> Self {
        let event_type = event_type.into();
        match serde_json::to_value(data) {
            Ok(data) => Self {
                event_type,
                success: false,
                data: Some(data),
                error: Some(error.into()),
            },
            Err(e) => Self::encoding_failure(event_type, e),
        }
    }

    fn encoding_failure(event_type: String, err: serde_json::Error) -> Self {
        warn!(%event_type, error = %err, "failed to encode envelope payload");
        Self::failure(event_type, format!("failed to encode payload: {err}"))
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::failure(events::ERROR, error)
    }
}

// ---------- Room / movement models ----------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedDto {
    pub user_id: SessionId,
    pub room_id: RoomId,
    pub spawn: Position,
    pub users: Vec<SessionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberNoticeDto {
    pub user_id: SessionId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementDto {
    pub user_id: SessionId,
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageDto {
    pub user_id: SessionId,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSentDto {
    pub message: String,
}

// ---------- Signaling models ----------

/// Routing wrapper for negotiation events; `payload` is opaque to the relay
/// until it is applied to a negotiation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub sender_id: SessionId,
    #[serde(default)]
    pub target_id: SessionId,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default, rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

// ---------- Collaborator models ----------

/// Authentication Service answer for a user lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthLookupResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub rooms: Vec<RoomId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDto {
    pub rooms: usize,
    pub sessions: usize,
}
