//! Shared fixtures for Aurora benchmarks.

use aurora_core::session::{SessionRecord, DEFAULT_COOKIE_NAME};
use aurora_core::storage::MemoryStorage;
use aurora_core::{
    Connection, DeliveryReceiver, Identity, MemoryProvider, Messenger, MessengerConfig,
    StoredSessions,
};
use aurora_protocol::ChatMessage;
use std::sync::Arc;

/// A message from `alice` to `bob` with a body of `len` bytes.
#[must_use]
pub fn message(len: usize) -> ChatMessage {
    ChatMessage::new("alice", "bob", "a".repeat(len))
}

/// A messenger over in-memory storage.
#[must_use]
pub fn messenger() -> Messenger {
    let provider = Arc::new(MemoryProvider::new());
    let sessions = StoredSessions::new(Arc::new(MemoryStorage::new()), DEFAULT_COOKIE_NAME);
    Messenger::new(provider, Arc::new(sessions), MessengerConfig::default())
}

/// Register a connection for `user`.
///
/// # Panics
///
/// Panics if the user ID cannot name a room.
#[must_use]
pub fn connect(messenger: &Messenger, user: &str) -> (Connection, DeliveryReceiver) {
    messenger
        .connect(Identity::new(user, user))
        .expect("valid bench user")
}

/// An unexpired session record for `user`.
#[must_use]
pub fn session(user: &str) -> SessionRecord {
    SessionRecord {
        user_id: user.to_string(),
        display_name: user.to_string(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
    }
}
