//! Per-connection state and the outbound queue that feeds a connection's writer task.

use shared::{Position, RoomId, ServerEnvelope, SessionId};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A serialized outbound envelope. Shared so a broadcast encodes once and
/// hands identical bytes to every member.
pub type Frame = Arc<str>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound channel closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

pub fn encode_frame(envelope: &ServerEnvelope) -> Result<Frame, SendError> {
    serde_json::to_string(envelope)
        .map(Frame::from)
        .map_err(|e| SendError::Encode(e.to_string()))
}

/// The registry-visible half of a session: identity plus the sending side of
/// the bounded outbound queue.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    connection_id: Uuid,
    outbound: mpsc::Sender<Frame>,
    dropped: AtomicU64,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue a frame without waiting. A full queue means the writer is behind;
    /// the frame is dropped rather than stalling the caller.
    pub fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|e| {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            }
        })
    }

    pub fn send(&self, envelope: &ServerEnvelope) -> Result<(), SendError> {
        self.send_frame(encode_frame(envelope)?)
    }

    /// True once the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Worker-owned session. Room and position are only changed through
/// [`crate::registry::ConnectionRegistry`].
#[derive(Debug)]
pub struct Session {
    handle: Arc<SessionHandle>,
    room_id: Option<RoomId>,
    position: Position,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, outbound: mpsc::Sender<Frame>) -> Self {
        let handle = SessionHandle {
            id: id.into(),
            connection_id: Uuid::new_v4(),
            outbound,
            dropped: AtomicU64::new(0),
        };
        debug!(session_id = %handle.id, connection_id = %handle.connection_id, "session created");
        Self {
            handle: Arc::new(handle),
            room_id: None,
            position: Position::default(),
        }
    }

    /// Session plus the receiving end its writer task drains.
    pub fn channel(id: impl Into<SessionId>, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn reply(&self, envelope: &ServerEnvelope) -> Result<(), SendError> {
        self.handle.send(envelope)
    }

    pub(crate) fn set_room(&mut self, room_id: Option<RoomId>) {
        self.room_id = room_id;
    }

    pub(crate) fn set_position(&mut self, position: Position) {
        self.position = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_is_queued_as_json() {
        let (session, mut rx) = Session::channel("alice", 4);
        session.reply(&ServerEnvelope::error("boom")).expect("queued");

        let frame = rx.recv().await.expect("frame");
        let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "error");
        assert_eq!(value["success"], false);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (session, _rx) = Session::channel("alice", 1);
        let handle = session.handle();
        assert!(handle.send_frame(Frame::from("one")).is_ok());
        assert_eq!(handle.send_frame(Frame::from("two")), Err(SendError::Full));
        assert_eq!(handle.dropped_frames(), 1);
    }

    #[tokio::test]
    async fn test_closed_receiver_reports_closed() {
        let (session, rx) = Session::channel("alice", 1);
        drop(rx);
        assert!(session.handle().is_closed());
        assert_eq!(session.handle().send_frame(Frame::from("x")), Err(SendError::Closed));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _rx_a) = Session::channel("alice", 1);
        let (b, _rx_b) = Session::channel("alice", 1);
        assert_ne!(a.handle().connection_id(), b.handle().connection_id());
        assert!(a.room_id().is_none());
        assert_eq!(a.position(), Position::default());
    }
}
