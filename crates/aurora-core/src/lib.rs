//! # aurora-core
//!
//! Rooms, presence, mailboxes and the delivery state machine for the Aurora
//! direct-messaging engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Presence** - Which users currently have a registered connection
//! - **Rooms** - Named groups of live connections with non-blocking emit
//! - **Storage** - Per-user key/value units with nested buckets
//! - **Mailbox** - Durable `outbox`/`inbox`/`drafts`/`read` buckets
//! - **Lifecycle** - Handshake, registration and teardown of connections
//! - **Messenger** - Dispatch of frames and deliveries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Messenger  │────▶│    Rooms    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Presence   │     │   Mailbox   │────▶│   Storage   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod connection;
pub mod lifecycle;
pub mod mailbox;
pub mod messenger;
pub mod presence;
pub mod room;
pub mod room_manager;
pub mod session;
pub mod storage;

pub use connection::{ConnectionHandle, ConnectionId, Delivery, DeliveryReceiver};
pub use lifecycle::{Connection, ConnectionState, Lifecycle};
pub use mailbox::{Bucket, Mailbox, MailboxError, Mailboxes};
pub use messenger::{Messenger, MessengerConfig, MessengerError, SpoofPolicy};
pub use presence::{PresenceCache, PresenceEntry};
pub use room::{personal_room, Room, RoomId, GLOBAL_ROOM};
pub use room_manager::{RoomError, RoomManager, RoomStats};
pub use session::{Identity, SessionRecord, SessionValidator, StoredSessions};
pub use storage::{MemoryProvider, SledProvider, Storage, StorageError, StorageProvider};
