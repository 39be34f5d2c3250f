use std::collections::{BTreeSet, HashMap};

use tracing::info;

use super::types::{ConnectionId, RoomId};

/// Room name -> member set. A room exists only while it has members.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, BTreeSet<ConnectionId>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room` (no-op if already present) and return the other
    /// members.
    pub fn join(&mut self, room: &RoomId, conn: ConnectionId) -> Vec<ConnectionId> {
        let members = self.rooms.entry(room.clone()).or_default();
        members.insert(conn);
        members.iter().copied().filter(|m| *m != conn).collect()
    }

    /// Remove `conn` from `room` and return the remaining members. Never
    /// fails; unknown rooms and non-members are a no-op.
    pub fn leave(&mut self, room: &RoomId, conn: &ConnectionId) -> Vec<ConnectionId> {
        let Some(members) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        members.remove(conn);

        if members.is_empty() {
            self.rooms.remove(room);
            info!("Room {} removed (empty)", room);
            return Vec::new();
        }
        members.iter().copied().collect()
    }

    pub fn members_of(&self, room: &RoomId) -> BTreeSet<ConnectionId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn contains(&self, room: &RoomId, conn: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(conn))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[cfg(test)]
    pub(crate) fn rooms(&self) -> impl Iterator<Item = (&RoomId, &BTreeSet<ConnectionId>)> {
        self.rooms.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(n: u64) -> ConnectionId {
        ConnectionId::from_u64(n)
    }

    #[test]
    fn first_joiner_sees_nobody() {
        let mut dir = RoomDirectory::new();
        assert!(dir.join(&RoomId::from("x"), conn(1)).is_empty());
    }

    #[test]
    fn join_returns_others_only() {
        let mut dir = RoomDirectory::new();
        let room = RoomId::from("x");
        dir.join(&room, conn(1));
        dir.join(&room, conn(2));
        let others = dir.join(&room, conn(3));
        assert_eq!(others, vec![conn(1), conn(2)]);
    }

    #[test]
    fn join_is_idempotent() {
        let mut dir = RoomDirectory::new();
        let room = RoomId::from("x");
        dir.join(&room, conn(1));
        dir.join(&room, conn(2));
        assert_eq!(dir.join(&room, conn(1)), vec![conn(2)]);
        assert_eq!(dir.members_of(&room).len(), 2);
    }

    #[test]
    fn leave_returns_remaining_members() {
        let mut dir = RoomDirectory::new();
        let room = RoomId::from("x");
        dir.join(&room, conn(1));
        dir.join(&room, conn(2));
        assert_eq!(dir.leave(&room, &conn(1)), vec![conn(2)]);
        assert!(!dir.contains(&room, &conn(1)));
    }

    #[test]
    fn leave_is_idempotent() {
        let mut dir = RoomDirectory::new();
        let room = RoomId::from("x");
        dir.join(&room, conn(1));
        dir.join(&room, conn(2));

        let once = dir.leave(&room, &conn(1));
        let twice = dir.leave(&room, &conn(1));
        assert_eq!(once, twice);
        assert_eq!(dir.members_of(&room), BTreeSet::from([conn(2)]));
    }

    #[test]
    fn leave_unknown_room_is_noop() {
        let mut dir = RoomDirectory::new();
        assert!(dir.leave(&RoomId::from("nowhere"), &conn(1)).is_empty());
        assert_eq!(dir.room_count(), 0);
    }

    #[test]
    fn empty_room_is_collected() {
        let mut dir = RoomDirectory::new();
        let room = RoomId::from("y");
        dir.join(&room, conn(9));
        dir.leave(&room, &conn(9));
        assert!(dir.members_of(&room).is_empty());
        assert_eq!(dir.room_count(), 0);
    }

    #[test]
    fn rooms_are_case_sensitive() {
        let mut dir = RoomDirectory::new();
        dir.join(&RoomId::from("Room"), conn(1));
        assert!(dir.join(&RoomId::from("room"), conn(2)).is_empty());
        assert_eq!(dir.room_count(), 2);
    }
}
