use std::collections::BTreeSet;

use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::directory::RoomDirectory;
use super::messages::{CastKind, ClientEvent, RawFields, ServerEvent, SignalKind};
use super::registry::ConnectionRegistry;
use super::types::{ConnectionId, OutboundMessage, RoomId};

/// Relays signaling traffic between connections and keeps the registry and
/// the room directory in step. Payloads are forwarded without inspection.
///
/// Unicast relays do not check that sender and target share a room.
#[derive(Debug, Default)]
pub struct SignalingRouter {
    registry: ConnectionRegistry,
    directory: RoomDirectory,
}

impl SignalingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    /// Register a transport channel and greet it with its own id.
    pub fn connect(&mut self, tx: mpsc::UnboundedSender<OutboundMessage>) -> ConnectionId {
        let id = self.registry.register(tx);
        self.registry.send(&id, ServerEvent::Connected(id).encode());
        info!("Connection {} registered", id);
        id
    }

    /// Forget a connection without touching rooms. Callers must have emptied
    /// its room set first.
    pub(crate) fn unregister(&mut self, id: &ConnectionId) -> BTreeSet<RoomId> {
        self.registry.unregister(id)
    }

    pub fn dispatch(&mut self, from: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom(room) => self.join_room(from, &room),
            ClientEvent::LeaveRoom(room) => self.leave_room(from, &room),
            ClientEvent::Signal {
                kind,
                target,
                payload,
            } => self.relay(kind, from, target, &payload),
            ClientEvent::RoomCast { kind, room, fields } => {
                self.room_cast(kind, from, &room, &fields)
            }
        }
    }

    pub fn join_room(&mut self, conn: ConnectionId, room: &RoomId) {
        if !self.registry.exists(&conn) {
            debug!("Dropping join of {} from unknown connection {}", room, conn);
            return;
        }

        let newly_joined = self.registry.add_room(&conn, room);
        let others = self.directory.join(room, conn);
        self.debug_check(&conn, room);

        if !newly_joined {
            debug!("Connection {} already in room {}", conn, room);
            return;
        }

        info!("Connection {} joined room {} ({} others)", conn, room, others.len());
        let msg = ServerEvent::UserJoined(conn).encode();
        for member in &others {
            self.registry.send(member, msg.clone());
        }
    }

    pub fn leave_room(&mut self, conn: ConnectionId, room: &RoomId) {
        let was_member = self.registry.remove_room(&conn, room);
        let remaining = self.directory.leave(room, &conn);
        self.debug_check(&conn, room);

        if !was_member {
            debug!("Connection {} was not in room {}", conn, room);
            return;
        }

        info!("Connection {} left room {}", conn, room);
        let msg = ServerEvent::UserLeft(conn).encode();
        for member in &remaining {
            self.registry.send(member, msg.clone());
        }
    }

    /// Deliver a negotiation blob to `to`, stamped with `from`. Dropped
    /// silently when either end is not live or `to == from`.
    pub fn relay(&self, kind: SignalKind, from: ConnectionId, to: ConnectionId, payload: &RawValue) {
        if from == to || !self.registry.exists(&from) {
            debug!("Dropping {} from {} to {}", kind.event_name(), from, to);
            return;
        }

        let msg = ServerEvent::Signal {
            kind,
            sender: from,
            payload,
        }
        .encode();
        if self.registry.send(&to, msg) {
            debug!("Relayed {} from {} to {}", kind.event_name(), from, to);
        } else {
            debug!("Target {} not live, {} dropped", to, kind.event_name());
        }
    }

    pub fn offer(&self, from: ConnectionId, to: ConnectionId, payload: &RawValue) {
        self.relay(SignalKind::Offer, from, to, payload)
    }

    pub fn answer(&self, from: ConnectionId, to: ConnectionId, payload: &RawValue) {
        self.relay(SignalKind::Answer, from, to, payload)
    }

    pub fn ice_candidate(&self, from: ConnectionId, to: ConnectionId, payload: &RawValue) {
        self.relay(SignalKind::IceCandidate, from, to, payload)
    }

    /// Fan an application event out to every member of `room` except `from`.
    pub fn room_cast(
        &self,
        kind: CastKind,
        from: ConnectionId,
        room: &RoomId,
        fields: &RawFields,
    ) {
        if !self.registry.exists(&from) {
            return;
        }
        let members = self.directory.members_of(room);
        if members.iter().all(|m| *m == from) {
            debug!("No recipients for {} in room {}", kind.event_name(), room);
            return;
        }

        let msg = ServerEvent::RoomCast {
            kind,
            sender: from,
            fields,
        }
        .encode();
        for member in members.iter().filter(|m| **m != from) {
            self.registry.send(member, msg.clone());
        }
        debug!("Cast {} from {} to room {}", kind.event_name(), from, room);
    }

    fn debug_check(&self, conn: &ConnectionId, room: &RoomId) {
        debug_assert_eq!(
            self.registry.rooms_of(conn).contains(room),
            self.directory.contains(room, conn),
            "registry and directory disagree on {} in {}",
            conn,
            room
        );
    }

    /// Full cross-check of both maps. Panics on the first mismatch.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (room, members) in self.directory.rooms() {
            assert!(!members.is_empty(), "empty room {} kept", room);
            for member in members {
                assert!(
                    self.registry.rooms_of(member).contains(room),
                    "{} listed in {} but registry disagrees",
                    member,
                    room
                );
            }
        }
    }
}
