//! Room abstraction for Aurora.
//!
//! Rooms are named sets of live connections. The messenger uses one global
//! room for announcements and one room per user as a private address for
//! live pushes.

use crate::connection::{ConnectionHandle, ConnectionId, Delivery};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Name of the room every registered connection joins.
pub const GLOBAL_ROOM: &str = "aurora";

/// A room identifier.
pub type RoomId = String;

/// Name of a user's personal room.
///
/// Prefixed so a user ID can never address the global room.
#[must_use]
pub fn personal_room(user_id: &str) -> RoomId {
    format!("user:{user_id}")
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// A room of connections.
#[derive(Debug)]
pub struct Room {
    /// Room name.
    name: RoomId,
    /// Members by connection ID.
    members: HashMap<ConnectionId, ConnectionHandle>,
}

impl Room {
    /// Create a new, empty room.
    #[must_use]
    pub fn new(name: impl Into<RoomId>) -> Self {
        Self {
            name: name.into(),
            members: HashMap::new(),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a connection.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn join(&mut self, connection: ConnectionHandle) -> bool {
        let id = connection.id().clone();
        let is_new = self.members.insert(id.clone(), connection).is_none();
        if is_new {
            debug!(room = %self.name, connection = %id, "Connection joined");
        }
        is_new
    }

    /// Remove a connection.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(room = %self.name, connection = %connection_id, "Connection left");
        }
        removed
    }

    /// Queue a delivery on every member.
    ///
    /// Returns the number of members whose queue accepted it.
    pub fn emit(&self, delivery: Delivery) -> usize {
        let delivery = Arc::new(delivery);
        trace!(room = %self.name, members = self.members.len(), "Emitting");
        self.members
            .values()
            .filter(|member| member.deliver(Arc::clone(&delivery)))
            .count()
    }

    /// Get all member connection IDs.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.keys().cloned().collect()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
