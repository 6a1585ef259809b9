//! Identity and room bookkeeping for the relay.
//!
//! The registry is plain owned state: no locking, no I/O. The coordinator
//! wraps it in its own critical section so every operation below runs as
//! one atomic step relative to other connections' events.

use std::collections::{BTreeSet, HashMap};

use huddle_protocol::{ConnectionId, Email, RoomId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinRejection {
    #[error("invalid email address")]
    InvalidIdentity,
    #[error("room id must not be empty")]
    InvalidRoom,
    #[error("{email} is already connected from another session")]
    DuplicateIdentity { email: String },
}

impl JoinRejection {
    /// Stable reason code sent to clients and used as a metric label.
    pub fn code(&self) -> &'static str {
        match self {
            JoinRejection::InvalidIdentity => "invalid_identity",
            JoinRejection::InvalidRoom => "invalid_room",
            JoinRejection::DuplicateIdentity { .. } => "duplicate_identity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub email: Email,
    pub room: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub email: Email,
    pub room: RoomId,
    /// Everyone else currently in the room.
    pub members: Vec<ConnectionId>,
    /// Set when the connection already held this exact seat.
    pub unchanged: bool,
    /// The room the connection moved out of, if any.
    pub left: Option<Departed>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub email: Email,
    pub room: RoomId,
    pub remaining: Vec<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room: RoomId,
    pub members: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    identities: HashMap<Email, ConnectionId>,
    participants: HashMap<ConnectionId, Participant>,
    rooms: HashMap<RoomId, BTreeSet<ConnectionId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &mut self,
        email: &str,
        connection_id: &ConnectionId,
        room: &str,
    ) -> Result<Accepted, JoinRejection> {
        let email = Email::parse(email).map_err(|_| JoinRejection::InvalidIdentity)?;
        let room = RoomId::parse(room).map_err(|_| JoinRejection::InvalidRoom)?;

        if let Some(owner) = self.identities.get(&email) {
            if owner != connection_id {
                return Err(JoinRejection::DuplicateIdentity {
                    email: email.to_string(),
                });
            }
        }

        // A connection only ever holds one identity and one room.
        let mut unchanged = false;
        let mut left = None;
        if let Some(previous) = self.participants.remove(connection_id) {
            unchanged = previous.room == room && previous.email == email;
            if previous.email != email {
                self.identities.remove(&previous.email);
            }
            if previous.room != room {
                let remaining = self.remove_member(&previous.room, connection_id);
                left = Some(Departed {
                    email: previous.email,
                    room: previous.room,
                    remaining,
                });
            }
        }

        self.identities.insert(email.clone(), connection_id.clone());
        self.participants.insert(
            connection_id.clone(),
            Participant {
                email: email.clone(),
                room: room.clone(),
            },
        );
        let members = self.rooms.entry(room.clone()).or_default();
        members.insert(connection_id.clone());
        let members = members
            .iter()
            .filter(|member| *member != connection_id)
            .cloned()
            .collect();

        Ok(Accepted {
            email,
            room,
            members,
            unchanged,
            left,
        })
    }

    /// Forget everything held for `connection_id`. Safe to call repeatedly.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<Departed> {
        let participant = self.participants.remove(connection_id)?;
        if self.identities.get(&participant.email) == Some(connection_id) {
            self.identities.remove(&participant.email);
        }
        let remaining = self.remove_member(&participant.room, connection_id);
        Some(Departed {
            email: participant.email,
            room: participant.room,
            remaining,
        })
    }

    pub fn members_of(&self, room: &str) -> BTreeSet<ConnectionId> {
        RoomId::parse(room)
            .ok()
            .and_then(|room| self.rooms.get(&room).cloned())
            .unwrap_or_default()
    }

    pub fn room_of(&self, connection_id: &ConnectionId) -> Option<RoomId> {
        self.participants
            .get(connection_id)
            .map(|participant| participant.room.clone())
    }

    pub fn email_of(&self, connection_id: &ConnectionId) -> Option<Email> {
        self.participants
            .get(connection_id)
            .map(|participant| participant.email.clone())
    }

    pub fn connection_for(&self, email: &str) -> Option<ConnectionId> {
        let email = Email::parse(email).ok()?;
        self.identities.get(&email).cloned()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .rooms
            .iter()
            .map(|(room, members)| RoomSnapshot {
                room: room.clone(),
                members: members.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room.as_str().cmp(b.room.as_str()));
        rooms
    }

    fn remove_member(&mut self, room: &RoomId, connection_id: &ConnectionId) -> Vec<ConnectionId> {
        let mut remove_room = false;
        let mut remaining = Vec::new();
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(connection_id);
            remaining = members.iter().cloned().collect();
            remove_room = members.is_empty();
        }
        if remove_room {
            self.rooms.remove(room);
        }
        remaining
    }
}
