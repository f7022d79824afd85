//! Connection lifecycle: handshake, registration and teardown.
//!
//! A connection moves `Pending → Authenticated → Registered → Closed`.
//! Registration joins the global room and the user's personal room before
//! marking presence, and teardown undoes it in reverse, so presence never
//! claims a user is online without a personal room to push to.

use crate::connection::{ConnectionHandle, ConnectionId, DeliveryReceiver};
use crate::messenger::MessengerError;
use crate::presence::PresenceCache;
use crate::room::{personal_room, RoomId, GLOBAL_ROOM};
use crate::room_manager::RoomManager;
use crate::session::{Identity, SessionValidator};
use axum::http::HeaderMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade requested, session not yet checked.
    Pending,
    /// Session validated.
    Authenticated,
    /// Joined its rooms and marked present.
    Registered,
    /// Torn down.
    Closed,
}

/// Wires connections into the room manager and presence cache.
pub struct Lifecycle {
    sessions: Arc<dyn SessionValidator>,
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceCache>,
}

impl Lifecycle {
    /// Create a lifecycle handler.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionValidator>,
        rooms: Arc<RoomManager>,
        presence: Arc<PresenceCache>,
    ) -> Self {
        Self {
            sessions,
            rooms,
            presence,
        }
    }

    /// Validate the upgrade request.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationRequired` if the request carries no valid,
    /// unexpired session. Nothing is registered in that case.
    pub async fn handshake(&self, headers: &HeaderMap) -> Result<Identity, MessengerError> {
        match self.sessions.validate(headers).await {
            Some(identity) => {
                debug!(user = %identity.user_id, "Handshake authenticated");
                Ok(identity)
            }
            None => {
                debug!("Handshake rejected");
                Err(MessengerError::AuthenticationRequired)
            }
        }
    }

    /// Register an authenticated connection.
    ///
    /// Returns the connection and the queue of deliveries addressed to it.
    ///
    /// # Errors
    ///
    /// Returns a room error if the user ID cannot name a room. Any room
    /// already joined is left again.
    pub fn connect(&self, identity: Identity) -> Result<(Connection, DeliveryReceiver), MessengerError> {
        let id = ConnectionId::generate();
        let (handle, rx) = ConnectionHandle::new(id, identity.user_id.clone());
        let rooms = [GLOBAL_ROOM.to_string(), personal_room(&identity.user_id)];

        for (i, room) in rooms.iter().enumerate() {
            if let Err(e) = self.rooms.join(room, &handle) {
                warn!(user = %identity.user_id, room = %room, error = %e, "Failed to join room");
                for joined in &rooms[..i] {
                    self.rooms.leave(joined, handle.id());
                }
                return Err(e.into());
            }
        }
        self.presence.add(&identity.user_id);

        info!(connection = %handle.id(), user = %identity.user_id, "Connection registered");

        let connection = Connection {
            identity,
            handle,
            rooms,
            state: ConnectionState::Registered,
            room_manager: Arc::clone(&self.rooms),
            presence: Arc::clone(&self.presence),
        };
        Ok((connection, rx))
    }
}

/// A registered connection.
///
/// Closing is idempotent and also happens on drop, so every way out of the
/// socket task tears the registration down exactly once.
pub struct Connection {
    identity: Identity,
    handle: ConnectionHandle,
    rooms: [RoomId; 2],
    state: ConnectionState,
    room_manager: Arc<RoomManager>,
    presence: Arc<PresenceCache>,
}

impl Connection {
    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.handle.id()
    }

    /// Authenticated identity bound to the connection.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Bound user ID.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Tear the registration down.
    ///
    /// Returns `true` if this call closed the connection, `false` if it was
    /// already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;

        self.presence.delete(self.user_id());
        for room in &self.rooms {
            self.room_manager.leave(room, self.handle.id());
        }

        info!(connection = %self.handle.id(), user = %self.identity.user_id, "Connection closed");
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", self.handle.id())
            .field("user_id", &self.identity.user_id)
            .field("state", &self.state)
            .finish()
    }
}
