//! Presence tracking for Aurora.
//!
//! Presence records which users currently have at least one registered
//! connection. It is only ever used as a routing hint: a stale answer costs
//! an extra inbox write or a fallback, never a lost message.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Presence state for a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Number of registered connections.
    pub connections: usize,
    /// When the user's first live connection registered.
    pub online_since: DateTime<Utc>,
}

impl PresenceEntry {
    fn new() -> Self {
        Self {
            connections: 0,
            online_since: Utc::now(),
        }
    }
}

/// Concurrent presence cache.
///
/// Entries are reference counted so that a user with several devices stays
/// online until the last connection closes.
#[derive(Debug, Default)]
pub struct PresenceCache {
    /// Map of user ID to presence state.
    online: DashMap<String, PresenceEntry>,
}

impl PresenceCache {
    /// Create an empty presence cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection for a user.
    ///
    /// Returns `true` if this call created the user's entry. An entry that a
    /// concurrent `delete` has counted down to zero but not yet removed is
    /// reused, and then neither call reports a change.
    pub fn add(&self, user_id: &str) -> bool {
        let (mut entry, came_online) = match self.online.entry(user_id.to_string()) {
            Entry::Occupied(occupied) => (occupied.into_ref(), false),
            Entry::Vacant(vacant) => (vacant.insert(PresenceEntry::new()), true),
        };
        entry.connections += 1;

        if came_online {
            debug!(user = %user_id, "Presence: user online");
        }
        came_online
    }

    /// Check whether a user has at least one registered connection.
    #[must_use]
    pub fn exists(&self, user_id: &str) -> bool {
        self.online.contains_key(user_id)
    }

    /// Drop one connection for a user.
    ///
    /// Returns `true` if this call removed the user's entry. Deleting an
    /// unknown user is a no-op.
    pub fn delete(&self, user_id: &str) -> bool {
        match self.online.get_mut(user_id) {
            Some(mut entry) => entry.connections = entry.connections.saturating_sub(1),
            None => return false,
        }

        // Re-checked under the shard lock so a concurrent add is not lost.
        let went_offline = self
            .online
            .remove_if(user_id, |_, entry| entry.connections == 0)
            .is_some();
        if went_offline {
            debug!(user = %user_id, "Presence: user offline");
        }
        went_offline
    }

    /// Get the presence state for a user.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PresenceEntry> {
        self.online.get(user_id).map(|e| e.clone())
    }

    /// Get the number of online users.
    #[must_use]
    pub fn count(&self) -> usize {
        self.online.len()
    }

    /// Get all online user IDs.
    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        self.online.iter().map(|e| e.key().clone()).collect()
    }

    /// Check if nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }
}
