//! Room manager for Aurora.
//!
//! Holds every live room and fans deliveries out to their members. The
//! room map is a `DashMap`, so joins, leaves and emits from independent
//! connection tasks only contend on the shard holding the room. A shard lock
//! is never held across an `.await` and never while touching presence.

use crate::connection::{ConnectionHandle, ConnectionId, Delivery};
use crate::room::{validate_room_name, Room, RoomId};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),
}

/// The room manager.
#[derive(Debug, Default)]
pub struct RoomManager {
    /// Rooms indexed by name.
    rooms: DashMap<RoomId, Room>,
}

impl RoomManager {
    /// Create an empty room manager.
    #[must_use]
    pub fn new() -> Self {
        info!("Creating room manager");
        Self::default()
    }

    /// Get room statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_count: self.rooms.len(),
            total_memberships: self.rooms.iter().map(|r| r.member_count()).sum(),
        }
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Joining twice is a no-op. Returns `true` if the connection was added.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid.
    pub fn join(&self, room: &str, connection: &ConnectionHandle) -> Result<bool, RoomError> {
        validate_room_name(room).map_err(RoomError::InvalidRoom)?;

        let mut entry = self.rooms.entry(room.to_string()).or_insert_with(|| {
            debug!(room = %room, "Creating new room");
            Room::new(room)
        });

        Ok(entry.join(connection.clone()))
    }

    /// Remove a connection from a room. Empty rooms are dropped.
    ///
    /// Leaving a room the connection is not in is a no-op. Returns `true` if
    /// the connection was removed.
    pub fn leave(&self, room: &str, connection_id: &ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut entry) => entry.leave(connection_id),
            None => return false,
        };

        // Re-checked under the shard lock so a concurrent join is not lost.
        if self.rooms.remove_if(room, |_, r| r.is_empty()).is_some() {
            debug!(room = %room, "Deleted empty room");
        }

        removed
    }

    /// Queue a delivery on every member of a room.
    ///
    /// Emitting to an empty or unknown room is a silent no-op. Never blocks.
    /// Returns the number of connections that accepted the delivery.
    pub fn emit(&self, room: &str, delivery: Delivery) -> usize {
        match self.rooms.get(room) {
            Some(entry) => {
                let count = entry.emit(delivery);
                trace!(room = %room, recipients = count, "Emitted");
                count
            }
            None => {
                trace!(room = %room, "Emit to unknown room");
                0
            }
        }
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Get the member count for a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.member_count()).unwrap_or(0)
    }

    /// Check whether a connection is a member of a room.
    #[must_use]
    pub fn is_member(&self, room: &str, connection_id: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .map(|r| r.is_member(connection_id))
            .unwrap_or(false)
    }

    /// Get all room names.
    #[must_use]
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }
}

/// Room statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    /// Number of live rooms.
    pub room_count: usize,
    /// Sum of members across all rooms.
    pub total_memberships: usize,
}
