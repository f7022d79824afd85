//! Message payloads carried by Aurora frames.
//!
//! `ChatMessage` is the unit that travels between two users and is what the
//! mailbox persists. `InfoMessage` is an ephemeral announcement that is never
//! stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of a chat message.
///
/// The status is informational only. A message's lifecycle state is the
/// mailbox bucket it lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageStatus {
    /// Not yet handled by the server.
    #[default]
    Pending = 0,
    /// Pushed live to an online recipient.
    Delivered = 1,
    /// Written to an offline recipient's inbox.
    Queued = 2,
    /// Could not be persisted.
    Failed = 3,
    /// Landed in the recipient's inbox after a live push.
    Received = 4,
}

impl From<MessageStatus> for u8 {
    fn from(status: MessageStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for MessageStatus {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageStatus::Pending),
            1 => Ok(MessageStatus::Delivered),
            2 => Ok(MessageStatus::Queued),
            3 => Ok(MessageStatus::Failed),
            4 => Ok(MessageStatus::Received),
            _ => Err("Invalid message status"),
        }
    }
}

/// A direct message between two users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message identifier. Empty until the message is first persisted.
    #[serde(default)]
    pub id: String,
    /// Declared sender user ID.
    pub sender_id: String,
    /// Recipient user ID.
    #[serde(alias = "recepient_id")]
    pub recipient_id: String,
    /// Message body.
    #[serde(default)]
    pub text: String,
    /// When the server accepted the message from the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// When the message landed in the recipient's inbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    /// Delivery status code.
    #[serde(default)]
    pub status: MessageStatus,
    /// Display name of the sender, stamped by the server.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_name: String,
}

impl ChatMessage {
    /// Create a new, unsent message.
    #[must_use]
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    /// Set the message ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Whether an ID has been assigned yet.
    #[must_use]
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }
}

/// An announcement broadcast to every connected user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMessage {
    /// Short title.
    #[serde(default)]
    pub title: String,
    /// Announcement body.
    #[serde(default)]
    pub body: String,
    /// Who sent it.
    #[serde(default)]
    pub sender: String,
}

impl InfoMessage {
    /// Create a new announcement.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            sender: sender.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_conversion() {
        assert_eq!(MessageStatus::try_from(1), Ok(MessageStatus::Delivered));
        assert_eq!(MessageStatus::try_from(2), Ok(MessageStatus::Queued));
        assert_eq!(u8::from(MessageStatus::Failed), 3);
        assert!(MessageStatus::try_from(9).is_err());
    }

    #[test]
    fn test_legacy_recipient_field() {
        let json = r#"{"sender_id":"alice","recepient_id":"bob","text":"hi"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.recipient_id, "bob");
        assert!(!msg.has_id());
        assert_eq!(msg.status, MessageStatus::Pending);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let msg = ChatMessage::new("alice", "bob", "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("sent_at").is_none());
        assert!(json.get("sender_name").is_none());
        assert_eq!(json["recipient_id"], "bob");
        assert_eq!(json["status"], 0);
    }
}
