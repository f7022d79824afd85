//! Frame types for the Aurora protocol.
//!
//! A frame is an event name plus a JSON payload. Each event name maps to
//! exactly one payload type, so a decoded `Frame` is always strongly typed.

use crate::message::{ChatMessage, InfoMessage};
use std::fmt;
use std::str::FromStr;

/// Event names used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// Client submits a message for delivery.
    Send,
    /// A message pushed live to its recipient.
    Receive,
    /// Delivery failed.
    SendFailed,
    /// Delivery succeeded (live or queued).
    SendSuccess,
    /// A message landed in the recipient's inbox.
    MessageInbox,
    /// A read acknowledgement was recorded.
    MessageRead,
    /// Client acknowledges reading a message.
    Read,
    /// Global announcement.
    Info,
}

impl EventName {
    /// All event names, in wire order.
    pub const ALL: [EventName; 8] = [
        EventName::Send,
        EventName::Receive,
        EventName::SendFailed,
        EventName::SendSuccess,
        EventName::MessageInbox,
        EventName::MessageRead,
        EventName::Read,
        EventName::Info,
    ];

    /// The wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventName::Send => "send",
            EventName::Receive => "receive",
            EventName::SendFailed => "sendFailed",
            EventName::SendSuccess => "sendSuccess",
            EventName::MessageInbox => "messageInbox",
            EventName::MessageRead => "messageRead",
            EventName::Read => "read",
            EventName::Info => "info",
        }
    }

    /// Whether a client may legitimately originate this event.
    #[must_use]
    pub const fn is_client_event(&self) -> bool {
        matches!(self, EventName::Send | EventName::Read | EventName::Info)
    }

    /// Whether this event is an alert about a prior client action.
    #[must_use]
    pub const fn is_alert(&self) -> bool {
        matches!(
            self,
            EventName::SendSuccess
                | EventName::SendFailed
                | EventName::MessageInbox
                | EventName::MessageRead
        )
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client submits a message.
    Send(ChatMessage),
    /// Message pushed to its recipient.
    Receive(ChatMessage),
    /// Delivery failed. Carries the message when one is relevant.
    SendFailed(Option<ChatMessage>),
    /// Delivery succeeded.
    SendSuccess(ChatMessage),
    /// Message saved in the recipient's inbox.
    MessageInbox(ChatMessage),
    /// Read acknowledgement recorded.
    MessageRead(ChatMessage),
    /// Client marks a message as read.
    Read(ChatMessage),
    /// Global announcement.
    Info(InfoMessage),
}

impl Frame {
    /// Get the event name of this frame.
    #[must_use]
    pub fn event(&self) -> EventName {
        match self {
            Frame::Send(_) => EventName::Send,
            Frame::Receive(_) => EventName::Receive,
            Frame::SendFailed(_) => EventName::SendFailed,
            Frame::SendSuccess(_) => EventName::SendSuccess,
            Frame::MessageInbox(_) => EventName::MessageInbox,
            Frame::MessageRead(_) => EventName::MessageRead,
            Frame::Read(_) => EventName::Read,
            Frame::Info(_) => EventName::Info,
        }
    }

    /// The chat message carried by this frame, if any.
    #[must_use]
    pub fn message(&self) -> Option<&ChatMessage> {
        match self {
            Frame::Send(m)
            | Frame::Receive(m)
            | Frame::SendSuccess(m)
            | Frame::MessageInbox(m)
            | Frame::MessageRead(m)
            | Frame::Read(m) => Some(m),
            Frame::SendFailed(m) => m.as_ref(),
            Frame::Info(_) => None,
        }
    }

    /// Create a `sendFailed` alert without a payload.
    #[must_use]
    pub fn send_failed() -> Self {
        Frame::SendFailed(None)
    }

    /// Create a `sendFailed` alert carrying the failed message.
    #[must_use]
    pub fn send_failed_with(message: ChatMessage) -> Self {
        Frame::SendFailed(Some(message))
    }
}
