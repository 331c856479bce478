use crate::movement::{validate_move, MoveOutcome};
use crate::session::{encode_frame, Frame, Session, SessionHandle};
use shared::{events, MovementDto, Position, RoomId, ServerEnvelope, SessionId};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("user {session_id} is already connected to room {room_id}")]
    DuplicateIdentity { session_id: SessionId, room_id: RoomId },
}

#[derive(Debug, Default)]
struct Room {
    members: HashMap<SessionId, Arc<SessionHandle>>,
}

impl Room {
    fn member_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.members.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Default)]
struct RoomTable {
    rooms: HashMap<RoomId, Room>,
    /// session id -> room id, so lookups don't scan every room.
    index: HashMap<SessionId, RoomId>,
}

impl RoomTable {
    fn handle(&self, session_id: &str) -> Option<(&RoomId, &Arc<SessionHandle>)> {
        let room_id = self.index.get(session_id)?;
        let handle = self.rooms.get(room_id)?.members.get(session_id)?;
        Some((room_id, handle))
    }

    /// With `connection` set, only that connection's entry is removed; a newer
    /// connection under the same id stays.
    fn detach(
        &mut self,
        session_id: &str,
        room_id: &str,
        connection: Option<Uuid>,
        prune_empty: bool,
    ) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let owned = match (room.members.get(session_id), connection) {
            (None, _) => false,
            (Some(handle), Some(connection_id)) => handle.connection_id() == connection_id,
            (Some(_), None) => true,
        };
        if !owned {
            return false;
        }
        room.members.remove(session_id);
        self.index.remove(session_id);
        if prune_empty && room.members.is_empty() {
            self.rooms.remove(room_id);
            debug!(room_id, "pruned empty room");
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReceipt {
    pub room_id: RoomId,
    /// Members after the join, the joiner included.
    pub members: Vec<SessionId>,
    pub created_room: bool,
    /// The same connection was already in this room; nothing changed.
    pub already_member: bool,
}

/// Owner of every room and the only place membership changes. Construct one
/// per process and share it by `Arc`.
#[derive(Debug)]
pub struct ConnectionRegistry {
    table: RwLock<RoomTable>,
    prune_empty_rooms: bool,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectionRegistry {
    pub fn new(prune_empty_rooms: bool) -> Self {
        Self {
            table: RwLock::new(RoomTable::default()),
            prune_empty_rooms,
        }
    }

    /// Insert the session into `room_id`, creating the room on first use.
    ///
    /// An identity held by another live connection is a conflict. A stale
    /// entry whose writer is gone is replaced.
    pub async fn add_session(
        &self,
        session: &mut Session,
        room_id: &str,
    ) -> Result<JoinReceipt, RegistryError> {
        let mut table = self.table.write().await;

        let mut already_member = false;
        let mut stale: Option<RoomId> = None;
        if let Some((current_room, existing)) = table.handle(session.id()) {
            let same_connection = existing.connection_id() == session.handle().connection_id();
            if same_connection && current_room == room_id {
                already_member = true;
            } else if !same_connection && existing.is_closed() {
                stale = Some(current_room.clone());
            } else {
                return Err(RegistryError::DuplicateIdentity {
                    session_id: session.id().to_string(),
                    room_id: current_room.clone(),
                });
            }
        }

        if let Some(stale_room) = stale {
            warn!(session_id = %session.id(), room_id = %stale_room, "replacing stale session");
            let stale_connection = table.handle(session.id()).map(|(_, h)| h.connection_id());
            table.detach(session.id(), &stale_room, stale_connection, self.prune_empty_rooms);
        }

        let created_room = !table.rooms.contains_key(room_id);
        if !already_member {
            table
                .rooms
                .entry(room_id.to_string())
                .or_default()
                .members
                .insert(session.id().to_string(), Arc::clone(session.handle()));
            table.index.insert(session.id().to_string(), room_id.to_string());
            info!(session_id = %session.id(), room_id, created_room, "session joined room");
        }
        session.set_room(Some(room_id.to_string()));

        let members = table
            .rooms
            .get(room_id)
            .map(Room::member_ids)
            .unwrap_or_default();

        Ok(JoinReceipt {
            room_id: room_id.to_string(),
            members,
            created_room,
            already_member,
        })
    }

    /// Remove `session_id` from `room_id`. Absent room or member is not an
    /// error; returns whether anything was removed.
    pub async fn remove_session(&self, session_id: &str, room_id: &str) -> bool {
        let mut table = self.table.write().await;
        let removed = table.detach(session_id, room_id, None, self.prune_empty_rooms);
        if removed {
            info!(session_id, room_id, "session left room");
        }
        removed
    }

    /// Remove this connection from the room it occupies and clear its room.
    ///
    /// Returns `None` when the registry entry already belongs to a newer
    /// connection under the same id; that entry is left alone.
    pub async fn leave(&self, session: &mut Session) -> Option<RoomId> {
        let room_id = session.room_id()?.to_string();
        session.set_room(None);
        let connection_id = session.handle().connection_id();
        let mut table = self.table.write().await;
        if !table.detach(session.id(), &room_id, Some(connection_id), self.prune_empty_rooms) {
            debug!(session_id = %session.id(), %room_id, "entry owned by another connection, not removed");
            return None;
        }
        info!(session_id = %session.id(), %room_id, "session left room");
        Some(room_id)
    }

    pub async fn lookup(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let table = self.table.read().await;
        table.handle(session_id).map(|(_, handle)| Arc::clone(handle))
    }

    /// Deliver `frame` to every member of `room_id`. Returns how many members
    /// accepted it.
    pub async fn broadcast(&self, room_id: &str, frame: Frame) -> usize {
        self.fan_out(room_id, frame, None).await
    }

    /// Like [`Self::broadcast`] but skips `exclude`.
    pub async fn broadcast_except(&self, room_id: &str, frame: Frame, exclude: &str) -> usize {
        self.fan_out(room_id, frame, Some(exclude)).await
    }

    pub async fn broadcast_envelope(
        &self,
        room_id: &str,
        envelope: &ServerEnvelope,
        exclude: Option<&str>,
    ) -> usize {
        match encode_frame(envelope) {
            Ok(frame) => self.fan_out(room_id, frame, exclude).await,
            Err(e) => {
                warn!(room_id, event_type = %envelope.event_type, error = %e, "failed to encode broadcast");
                0
            }
        }
    }

    async fn fan_out(&self, room_id: &str, frame: Frame, exclude: Option<&str>) -> usize {
        let table = self.table.read().await;
        let Some(room) = table.rooms.get(room_id) else {
            debug!(room_id, "broadcast to unknown room");
            return 0;
        };

        let mut delivered = 0;
        for (member_id, handle) in &room.members {
            if exclude == Some(member_id.as_str()) {
                continue;
            }
            // try_send only; a slow member never holds up the rest.
            match handle.send_frame(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    room_id,
                    session_id = %member_id,
                    dropped = handle.dropped_frames(),
                    error = %e,
                    "failed to deliver broadcast to member"
                ),
            }
        }
        debug!(room_id, delivered, members = room.members.len(), "broadcast");
        delivered
    }

    /// Validate and apply a move, then tell the rest of the room.
    pub async fn move_session(&self, session: &mut Session, requested: Position) -> MoveOutcome {
        let outcome = validate_move(session.position(), requested);
        match outcome {
            MoveOutcome::Accepted(position) => {
                session.set_position(position);
                if let Some(room_id) = session.room_id() {
                    let movement = ServerEnvelope::ok(
                        events::MOVEMENT,
                        MovementDto {
                            user_id: session.id().to_string(),
                            x: position.x,
                            y: position.y,
                        },
                    );
                    self.broadcast_envelope(room_id, &movement, Some(session.id()))
                        .await;
                }
            }
            MoveOutcome::Rejected(position) => {
                debug!(session_id = %session.id(), ?position, ?requested, "move rejected");
            }
        }
        outcome
    }

    pub async fn members(&self, room_id: &str) -> Vec<SessionId> {
        let table = self.table.read().await;
        table
            .rooms
            .get(room_id)
            .map(Room::member_ids)
            .unwrap_or_default()
    }

    pub async fn contains_room(&self, room_id: &str) -> bool {
        self.table.read().await.rooms.contains_key(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.table.read().await.rooms.len()
    }

    pub async fn session_count(&self) -> usize {
        self.table.read().await.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(id: &str) -> (Session, mpsc::Receiver<Frame>) {
        Session::channel(id, 8)
    }

    #[tokio::test]
    async fn test_first_join_creates_room_with_one_member() {
        let registry = ConnectionRegistry::default();
        let (mut alice, _rx) = session("alice");

        let receipt = registry.add_session(&mut alice, "r1").await.expect("join");

        assert!(receipt.created_room);
        assert_eq!(receipt.members, vec!["alice".to_string()]);
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(alice.room_id(), Some("r1"));
    }

    #[tokio::test]
    async fn test_second_member_does_not_overwrite_first() {
        let registry = ConnectionRegistry::default();
        let (mut alice, _rx_a) = session("alice");
        let (mut bob, _rx_b) = session("bob");

        registry.add_session(&mut alice, "r1").await.expect("alice joins");
        let receipt = registry.add_session(&mut bob, "r1").await.expect("bob joins");

        assert!(!receipt.created_room);
        assert_eq!(receipt.members, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let registry = ConnectionRegistry::default();
        let (mut first, _rx_1) = session("alice");
        let (mut second, _rx_2) = session("alice");

        registry.add_session(&mut first, "r1").await.expect("first join");
        let err = registry.add_session(&mut second, "r2").await.unwrap_err();

        assert_eq!(
            err,
            RegistryError::DuplicateIdentity {
                session_id: "alice".into(),
                room_id: "r1".into()
            }
        );
        assert!(second.room_id().is_none());
        assert!(!registry.contains_room("r2").await);
        let handle = registry.lookup("alice").await.expect("still registered");
        assert_eq!(handle.connection_id(), first.handle().connection_id());
    }

    #[tokio::test]
    async fn test_rejoin_same_room_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let (mut alice, _rx) = session("alice");

        registry.add_session(&mut alice, "r1").await.expect("join");
        let receipt = registry.add_session(&mut alice, "r1").await.expect("rejoin");

        assert!(receipt.already_member);
        assert_eq!(receipt.members.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_identity_is_replaced() {
        let registry = ConnectionRegistry::default();
        let (mut old, old_rx) = session("alice");
        registry.add_session(&mut old, "r1").await.expect("join");
        drop(old_rx);

        let (mut fresh, _rx) = session("alice");
        registry.add_session(&mut fresh, "r2").await.expect("replace stale");

        assert!(!registry.contains_room("r1").await);
        let handle = registry.lookup("alice").await.expect("registered");
        assert_eq!(handle.connection_id(), fresh.handle().connection_id());
    }

    #[tokio::test]
    async fn test_replaced_connection_leaving_keeps_replacement() {
        let registry = ConnectionRegistry::default();
        let (mut old, old_rx) = session("alice");
        registry.add_session(&mut old, "r1").await.expect("join");
        drop(old_rx);
        let (mut fresh, _rx) = session("alice");
        registry.add_session(&mut fresh, "r1").await.expect("replace stale");

        assert_eq!(registry.leave(&mut old).await, None);

        assert!(old.room_id().is_none());
        let handle = registry.lookup("alice").await.expect("replacement kept");
        assert_eq!(handle.connection_id(), fresh.handle().connection_id());
        assert_eq!(registry.members("r1").await, vec!["alice".to_string()]);
        assert_eq!(registry.leave(&mut fresh).await, Some("r1".to_string()));
        assert!(registry.lookup("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_then_lookup_not_found() {
        let registry = ConnectionRegistry::default();
        let (mut alice, _rx) = session("alice");
        registry.add_session(&mut alice, "r1").await.expect("join");

        assert!(registry.remove_session("alice", "r1").await);
        assert!(registry.lookup("alice").await.is_none());
        assert!(!registry.contains_room("r1").await);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let registry = ConnectionRegistry::default();
        assert!(!registry.remove_session("ghost", "nowhere").await);

        let (mut alice, _rx) = session("alice");
        registry.add_session(&mut alice, "r1").await.expect("join");
        assert!(!registry.remove_session("alice", "r2").await);
        assert!(registry.lookup("alice").await.is_some());
    }

    #[tokio::test]
    async fn test_empty_rooms_kept_when_pruning_disabled() {
        let registry = ConnectionRegistry::new(false);
        let (mut alice, _rx) = session("alice");
        registry.add_session(&mut alice, "r1").await.expect("join");

        assert_eq!(registry.leave(&mut alice).await, Some("r1".to_string()));
        assert!(registry.contains_room("r1").await);
        assert!(registry.members("r1").await.is_empty());
        assert!(alice.room_id().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member_with_same_bytes() {
        let registry = ConnectionRegistry::default();
        let mut receivers = Vec::new();
        let mut sessions = Vec::new();
        for id in ["a", "b", "c"] {
            let (mut s, rx) = session(id);
            registry.add_session(&mut s, "r1").await.expect("join");
            sessions.push(s);
            receivers.push(rx);
        }

        let delivered = registry.broadcast("r1", Frame::from("hello")).await;

        assert_eq!(delivered, 3);
        for rx in &mut receivers {
            assert_eq!(&*rx.try_recv().expect("frame"), "hello");
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_broadcast_failure_does_not_block_others() {
        let registry = ConnectionRegistry::default();
        let (mut a, rx_a) = session("a");
        let (mut b, mut rx_b) = session("b");
        let (mut c, mut rx_c) = session("c");
        for s in [&mut a, &mut b, &mut c] {
            registry.add_session(s, "r1").await.expect("join");
        }
        drop(rx_a);

        let delivered = registry.broadcast("r1", Frame::from("ping")).await;

        assert_eq!(delivered, 2);
        assert_eq!(&*rx_b.try_recv().expect("b"), "ping");
        assert_eq!(&*rx_c.try_recv().expect("c"), "ping");
        // Failed delivery never evicts; only the disconnect path does.
        assert_eq!(registry.members("r1").await.len(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let registry = ConnectionRegistry::default();
        let (mut slow, mut rx_slow) = Session::channel("slow", 1);
        let (mut b, mut rx_b) = session("b");
        let (mut c, mut rx_c) = session("c");
        for s in [&mut slow, &mut b, &mut c] {
            registry.add_session(s, "r1").await.expect("join");
        }
        slow.handle().send_frame(Frame::from("backlog")).expect("fills queue");

        let delivered = registry.broadcast("r1", Frame::from("ping")).await;

        assert_eq!(delivered, 2);
        assert_eq!(&*rx_b.try_recv().expect("b"), "ping");
        assert_eq!(&*rx_c.try_recv().expect("c"), "ping");
        assert_eq!(slow.handle().dropped_frames(), 1);
        assert_eq!(registry.members("r1").await.len(), 3);
        assert_eq!(&*rx_slow.try_recv().expect("backlog"), "backlog");
        assert!(rx_slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcasts_arrive_in_issue_order() {
        let registry = ConnectionRegistry::default();
        let mut sessions = Vec::new();
        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (mut s, rx) = session(id);
            registry.add_session(&mut s, "r1").await.expect("join");
            sessions.push(s);
            receivers.push(rx);
        }

        registry.broadcast("r1", Frame::from("first")).await;
        registry.broadcast("r1", Frame::from("second")).await;

        for rx in &mut receivers {
            assert_eq!(&*rx.try_recv().expect("first"), "first");
            assert_eq!(&*rx.try_recv().expect("second"), "second");
        }
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_sender() {
        let registry = ConnectionRegistry::default();
        let (mut a, mut rx_a) = session("a");
        let (mut b, mut rx_b) = session("b");
        registry.add_session(&mut a, "r1").await.expect("join");
        registry.add_session(&mut b, "r1").await.expect("join");

        assert_eq!(registry.broadcast_except("r1", Frame::from("x"), "a").await, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(&*rx_b.try_recv().expect("b"), "x");
    }

    #[tokio::test]
    async fn test_broadcast_unknown_room_delivers_nothing() {
        let registry = ConnectionRegistry::default();
        assert_eq!(registry.broadcast("none", Frame::from("x")).await, 0);
    }

    #[tokio::test]
    async fn test_move_session_updates_and_broadcasts() {
        let registry = ConnectionRegistry::default();
        let (mut alice, mut rx_a) = session("alice");
        let (mut bob, mut rx_b) = session("bob");
        registry.add_session(&mut alice, "r1").await.expect("join");
        registry.add_session(&mut bob, "r1").await.expect("join");

        let outcome = registry.move_session(&mut alice, Position::new(0, 1)).await;
        assert_eq!(outcome, MoveOutcome::Accepted(Position::new(0, 1)));
        assert_eq!(alice.position(), Position::new(0, 1));

        let frame = rx_b.try_recv().expect("movement");
        let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "movement");
        assert_eq!(value["data"]["userId"], "alice");
        assert_eq!(value["data"]["y"], 1);
        assert!(rx_a.try_recv().is_err());

        let outcome = registry.move_session(&mut alice, Position::new(5, 5)).await;
        assert_eq!(outcome, MoveOutcome::Rejected(Position::new(0, 1)));
        assert_eq!(alice.position(), Position::new(0, 1));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_joins_and_leaves_stay_consistent() {
        let registry = Arc::new(ConnectionRegistry::default());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (mut s, rx) = Session::channel(format!("user-{i}"), 4);
                registry.add_session(&mut s, "busy").await.expect("join");
                if i % 2 == 0 {
                    registry.leave(&mut s).await;
                }
                drop(rx);
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        let members = registry.members("busy").await;
        assert_eq!(members.len(), 16);
        assert_eq!(registry.session_count().await, 16);
        assert!(members.iter().all(|id| {
            let n: usize = id.trim_start_matches("user-").parse().expect("numeric suffix");
            n % 2 == 1
        }));
    }
}
