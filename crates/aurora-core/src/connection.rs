//! Connection handles and room deliveries.
//!
//! The transport owns the socket. The core only keeps a `ConnectionHandle`,
//! a cheap clone holding the connection's identity and the sending half of
//! its delivery queue.

use aurora_protocol::{ChatMessage, InfoMessage};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An event emitted into a room and queued on each member connection.
///
/// Deliveries pass through the messenger on the receiving connection before
/// anything is written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A message pushed live to its recipient.
    Receive(ChatMessage),
    /// The recipient could not store a message; tells the sender.
    SendFailed(ChatMessage),
    /// Global announcement.
    Info(InfoMessage),
}

/// Receiving half of a connection's delivery queue.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Arc<Delivery>>;

/// A non-owning handle to a registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: String,
    outbound: mpsc::UnboundedSender<Arc<Delivery>>,
}

impl ConnectionHandle {
    /// Create a handle and the queue it feeds.
    #[must_use]
    pub fn new(id: ConnectionId, user_id: impl Into<String>) -> (Self, DeliveryReceiver) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            user_id: user_id.into(),
            outbound,
        };
        (handle, rx)
    }

    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// User bound to the connection.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue a delivery. Never blocks.
    ///
    /// Returns `false` if the connection's task has already gone away.
    pub fn deliver(&self, delivery: Arc<Delivery>) -> bool {
        self.outbound.send(delivery).is_ok()
    }

    /// Check whether the receiving side is still alive.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_handle_delivery() {
        let (handle, mut rx) = ConnectionHandle::new("conn-1".into(), "alice");
        let info = Delivery::Info(InfoMessage::new("hello", "world", "ops"));

        assert!(handle.deliver(Arc::new(info.clone())));
        assert_eq!(*rx.try_recv().unwrap(), info);

        drop(rx);
        assert!(!handle.is_open());
        assert!(!handle.deliver(Arc::new(info)));
    }
}
