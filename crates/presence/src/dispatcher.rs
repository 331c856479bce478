//! Per-connection protocol state machine and event routing.

use crate::auth::{is_authorized, Authenticator};
use crate::movement::MoveOutcome;
use crate::registry::ConnectionRegistry;
use crate::session::{SendError, Session};
use crate::signaling::SignalingRelay;
use serde_json::Value;
use shared::{
    events, ChatMessageDto, ClientEnvelope, JoinRequest, JoinedDto, MemberNoticeDto,
    MessageSentDto, Position, RoomId, ServerEnvelope, SignalMessage,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const NOT_JOINED: &str = "Join a room first";

/// Faults that end the connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
    #[error("outbound channel closed")]
    OutboundClosed,
}

/// Recognized event with a payload that doesn't fit. Reported, not fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Invalid join data")]
    InvalidJoin,
    #[error("Invalid message format")]
    InvalidMessage,
    #[error("Invalid move data")]
    InvalidMove,
    #[error("Invalid WebRTC message format")]
    InvalidSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Join(JoinRequest),
    LeaveRoom,
    SendMessage(String),
    Move(Position),
    Signal(SignalKind, SignalMessage),
    Unknown(String),
}

impl ClientEvent {
    pub fn decode(envelope: ClientEnvelope) -> Result<Self, RequestError> {
        let ClientEnvelope { event_type, data } = envelope;
        let event = match event_type.as_str() {
            events::JOIN => {
                let request = if data.is_null() {
                    JoinRequest::default()
                } else {
                    serde_json::from_value(data).map_err(|_| RequestError::InvalidJoin)?
                };
                ClientEvent::Join(request)
            }
            events::LEAVE_ROOM => ClientEvent::LeaveRoom,
            events::SEND_MESSAGE => match data {
                Value::String(message) => ClientEvent::SendMessage(message),
                _ => return Err(RequestError::InvalidMessage),
            },
            events::MOVE => ClientEvent::Move(
                serde_json::from_value(data).map_err(|_| RequestError::InvalidMove)?,
            ),
            events::WEBRTC_OFFER | events::WEBRTC_ANSWER | events::WEBRTC_CANDIDATE => {
                let kind = match event_type.as_str() {
                    events::WEBRTC_OFFER => SignalKind::Offer,
                    events::WEBRTC_ANSWER => SignalKind::Answer,
                    _ => SignalKind::Candidate,
                };
                let message =
                    serde_json::from_value(data).map_err(|_| RequestError::InvalidSignal)?;
                ClientEvent::Signal(kind, message)
            }
            _ => ClientEvent::Unknown(event_type),
        };
        Ok(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Joined,
    Closed,
}

/// Everything one worker owns for its connection.
#[derive(Debug)]
pub struct Connection {
    session: Session,
    state: ConnectionState,
    default_room: RoomId,
}

impl Connection {
    /// `default_room` is the room named in the handshake.
    pub fn new(session: Session, default_room: impl Into<RoomId>) -> Self {
        Self {
            session,
            state: ConnectionState::Connecting,
            default_room: default_room.into(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    relay: Arc<SignalingRelay>,
    auth: Arc<dyn Authenticator>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        relay: Arc<SignalingRelay>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry,
            relay,
            auth,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle one inbound text frame. `Err` means the connection must close.
    pub async fn handle_frame(
        &self,
        conn: &mut Connection,
        frame: &str,
    ) -> Result<(), DispatchError> {
        let envelope: ClientEnvelope = serde_json::from_str(frame)?;
        debug!(session_id = %conn.session.id(), event_type = %envelope.event_type, "received event");

        let response = match ClientEvent::decode(envelope) {
            Ok(event) => self.handle_event(conn, event).await,
            Err(e) => Some(ServerEnvelope::error(e.to_string())),
        };

        match response {
            Some(response) => match conn.session.reply(&response) {
                Ok(()) => Ok(()),
                Err(SendError::Closed) => Err(DispatchError::OutboundClosed),
                Err(e) => {
                    warn!(session_id = %conn.session.id(), error = %e, "dropping response");
                    Ok(())
                }
            },
            None => Ok(()),
        }
    }

    pub async fn handle_event(
        &self,
        conn: &mut Connection,
        event: ClientEvent,
    ) -> Option<ServerEnvelope> {
        match event {
            ClientEvent::Join(request) => Some(self.join(conn, request).await),
            ClientEvent::LeaveRoom => Some(self.leave(conn).await),
            ClientEvent::SendMessage(message) => Some(self.send_message(conn, message).await),
            ClientEvent::Move(requested) => Some(self.move_to(conn, requested).await),
            ClientEvent::Signal(kind, message) => self.signal(conn, kind, message).await,
            ClientEvent::Unknown(event_type) => {
                debug!(session_id = %conn.session.id(), %event_type, "unknown event type");
                Some(ServerEnvelope::error("Unknown event type"))
            }
        }
    }

    async fn join(&self, conn: &mut Connection, request: JoinRequest) -> ServerEnvelope {
        let room_id = request
            .room_id
            .filter(|room| !room.is_empty())
            .unwrap_or_else(|| conn.default_room.clone());
        if room_id.is_empty() {
            return ServerEnvelope::failure(events::USER_JOINING_FAILED, "Room id is required");
        }

        // Outside any registry lock.
        if !is_authorized(self.auth.as_ref(), conn.session.id(), &room_id).await {
            info!(session_id = %conn.session.id(), %room_id, "join denied");
            return ServerEnvelope::failure(
                events::USER_JOINING_FAILED,
                "User does not have access to this room",
            );
        }

        let receipt = match self.registry.add_session(&mut conn.session, &room_id).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(session_id = %conn.session.id(), %room_id, error = %e, "join rejected");
                return ServerEnvelope::failure(events::USER_JOINING_FAILED, e.to_string());
            }
        };
        conn.state = ConnectionState::Joined;

        let position = conn.session.position();
        if !receipt.already_member {
            let notice = ServerEnvelope::ok(
                events::USER_JOINED,
                MemberNoticeDto {
                    user_id: conn.session.id().to_string(),
                    room_id: room_id.clone(),
                    position: Some(position),
                },
            );
            self.registry
                .broadcast_envelope(&room_id, &notice, Some(conn.session.id()))
                .await;
        }

        ServerEnvelope::ok(
            events::USER_JOINED,
            JoinedDto {
                user_id: conn.session.id().to_string(),
                room_id,
                spawn: position,
                users: receipt.members,
            },
        )
    }

    async fn leave(&self, conn: &mut Connection) -> ServerEnvelope {
        if conn.state != ConnectionState::Joined {
            return ServerEnvelope::failure(events::USER_LEFT, NOT_JOINED);
        }
        let departed = self.depart(conn).await;
        conn.state = ConnectionState::Connecting;
        let Some(room_id) = departed else {
            return ServerEnvelope::failure(events::USER_LEFT, NOT_JOINED);
        };
        ServerEnvelope::ok(
            events::USER_LEFT,
            MemberNoticeDto {
                user_id: conn.session.id().to_string(),
                room_id,
                position: None,
            },
        )
    }

    /// Leave the current room, drop any negotiation and tell the remaining members.
    /// Does nothing beyond clearing the room when a newer connection owns the entry.
    async fn depart(&self, conn: &mut Connection) -> Option<RoomId> {
        let room_id = self.registry.leave(&mut conn.session).await?;
        self.relay.close(conn.session.id()).await;
        let notice = ServerEnvelope::ok(
            events::USER_LEFT,
            MemberNoticeDto {
                user_id: conn.session.id().to_string(),
                room_id: room_id.clone(),
                position: None,
            },
        );
        self.registry.broadcast_envelope(&room_id, &notice, None).await;
        Some(room_id)
    }

    async fn send_message(&self, conn: &mut Connection, message: String) -> ServerEnvelope {
        let Some(room_id) = self.joined_room(conn) else {
            return ServerEnvelope::error(NOT_JOINED);
        };
        let chat = ServerEnvelope::ok(
            events::MESSAGE,
            ChatMessageDto {
                user_id: conn.session.id().to_string(),
                message: message.clone(),
            },
        );
        self.registry.broadcast_envelope(&room_id, &chat, None).await;
        ServerEnvelope::ok(events::MESSAGE_SENT, MessageSentDto { message })
    }

    async fn move_to(&self, conn: &mut Connection, requested: Position) -> ServerEnvelope {
        if self.joined_room(conn).is_none() {
            return ServerEnvelope::error(NOT_JOINED);
        }
        match self.registry.move_session(&mut conn.session, requested).await {
            MoveOutcome::Accepted(position) => ServerEnvelope::ok(events::MOVE_COMPLETED, position),
            MoveOutcome::Rejected(position) => {
                ServerEnvelope::rejected(events::MOVE_COMPLETED, position, "Invalid move")
            }
        }
    }

    async fn signal(
        &self,
        conn: &mut Connection,
        kind: SignalKind,
        message: SignalMessage,
    ) -> Option<ServerEnvelope> {
        if self.joined_room(conn).is_none() {
            return Some(ServerEnvelope::error(NOT_JOINED));
        }
        let session_id = conn.session.id();
        let result = match kind {
            SignalKind::Offer => self.relay.handle_offer(session_id, message).await,
            SignalKind::Answer => self.relay.handle_answer(session_id, message).await,
            SignalKind::Candidate => self.relay.handle_ice_candidate(session_id, message).await,
        };
        match result {
            Ok(()) => None,
            Err(e) => {
                warn!(session_id, ?kind, error = %e, "signaling request failed");
                Some(ServerEnvelope::error(e.to_string()))
            }
        }
    }

    /// Cleanup when the channel closes or a read fails.
    pub async fn disconnect(&self, conn: &mut Connection) {
        if conn.state == ConnectionState::Joined {
            self.depart(conn).await;
        }
        conn.state = ConnectionState::Closed;
        info!(session_id = %conn.session.id(), "connection closed");
    }

    fn joined_room(&self, conn: &Connection) -> Option<RoomId> {
        if conn.state != ConnectionState::Joined {
            return None;
        }
        conn.session.room_id().map(str::to_string)
    }
}
