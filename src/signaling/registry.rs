use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc;

use super::types::{ConnectionId, OutboundMessage, RoomId};

/// Odd multiplier; multiplication by an odd constant is a bijection on u64.
const ID_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug)]
struct ConnectionEntry {
    /// Channel to the connection's writer task
    tx: mpsc::UnboundedSender<OutboundMessage>,
    rooms: BTreeSet<RoomId>,
}

/// Live connections and the rooms each one has joined.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    salt: u64,
    next_seq: u64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_salt(rand::random())
    }

    pub(crate) fn with_salt(salt: u64) -> Self {
        Self {
            connections: HashMap::new(),
            salt,
            next_seq: 0,
        }
    }

    /// Assign a fresh identity to a new transport channel. Identities are
    /// never handed out twice by the same registry.
    pub fn register(&mut self, tx: mpsc::UnboundedSender<OutboundMessage>) -> ConnectionId {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let id = ConnectionId::from_u64(seq.wrapping_mul(ID_MIX) ^ self.salt);

        self.connections.insert(
            id,
            ConnectionEntry {
                tx,
                rooms: BTreeSet::new(),
            },
        );
        id
    }

    /// Drop the identity and return the rooms it still belonged to.
    /// Unknown ids yield an empty set.
    pub fn unregister(&mut self, id: &ConnectionId) -> BTreeSet<RoomId> {
        self.connections
            .remove(id)
            .map(|entry| entry.rooms)
            .unwrap_or_default()
    }

    pub fn exists(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn rooms_of(&self, id: &ConnectionId) -> BTreeSet<RoomId> {
        self.connections
            .get(id)
            .map(|entry| entry.rooms.clone())
            .unwrap_or_default()
    }

    /// Returns true if the room was newly recorded.
    pub(crate) fn add_room(&mut self, id: &ConnectionId, room: &RoomId) -> bool {
        match self.connections.get_mut(id) {
            Some(entry) => entry.rooms.insert(room.clone()),
            None => false,
        }
    }

    /// Returns true if the room was recorded before.
    pub(crate) fn remove_room(&mut self, id: &ConnectionId, room: &RoomId) -> bool {
        match self.connections.get_mut(id) {
            Some(entry) => entry.rooms.remove(room),
            None => false,
        }
    }

    /// Queue a message for a live connection. Returns false if the id is
    /// unknown or its writer has gone away.
    pub(crate) fn send(&self, id: &ConnectionId, msg: OutboundMessage) -> bool {
        match self.connections.get(id) {
            Some(entry) => entry.tx.send(msg).is_ok(),
            None => false,
        }
    }
}
