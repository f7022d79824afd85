//! Codec for encoding and decoding Aurora frames.
//!
//! The encoded format is UTF-8 text:
//! - the event name
//! - a single ASCII space
//! - the JSON payload
//!
//! The transport's own message boundaries delimit frames, so there is no
//! length prefix. Decoding splits on the first space only.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::frames::{EventName, Frame};

/// Maximum size of a frame read from a client (64 KiB).
///
/// Frames written by the server carry fields the client never sends (ID,
/// timestamps, sender name), so encoding is not capped.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Separator between the event name and the payload.
pub const SEPARATOR: char = ' ';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// No space between event name and payload.
    #[error("Unable to extract event name from frame")]
    MissingSeparator,

    /// Event name is not part of the vocabulary.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Payload is not valid JSON for the event.
    #[error("Invalid payload for {event}: {source}")]
    Json {
        /// Event whose payload failed.
        event: EventName,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a frame to text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let event = frame.event();
    let payload = match frame {
        Frame::Send(m)
        | Frame::Receive(m)
        | Frame::SendSuccess(m)
        | Frame::MessageInbox(m)
        | Frame::MessageRead(m)
        | Frame::Read(m) => to_json(event, m)?,
        Frame::SendFailed(m) => to_json(event, m)?,
        Frame::Info(info) => to_json(event, info)?,
    };

    let mut out = String::with_capacity(event.as_str().len() + 1 + payload.len());
    out.push_str(event.as_str());
    out.push(SEPARATOR);
    out.push_str(&payload);
    Ok(out)
}

/// Decode a frame from text.
///
/// # Errors
///
/// Returns an error if the frame is too large, has no separator, names an
/// unknown event, or carries a payload that does not match the event.
pub fn decode(data: &str) -> Result<Frame, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let (name, payload) = data
        .split_once(SEPARATOR)
        .ok_or(ProtocolError::MissingSeparator)?;
    let event: EventName = name.parse().map_err(ProtocolError::UnknownEvent)?;

    let frame = match event {
        EventName::Send => Frame::Send(from_json(event, payload)?),
        EventName::Receive => Frame::Receive(from_json(event, payload)?),
        EventName::SendFailed => Frame::SendFailed(from_json(event, payload)?),
        EventName::SendSuccess => Frame::SendSuccess(from_json(event, payload)?),
        EventName::MessageInbox => Frame::MessageInbox(from_json(event, payload)?),
        EventName::MessageRead => Frame::MessageRead(from_json(event, payload)?),
        EventName::Read => Frame::Read(from_json(event, payload)?),
        EventName::Info => Frame::Info(from_json(event, payload)?),
    };

    Ok(frame)
}

fn to_json<T: Serialize + ?Sized>(event: EventName, value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|source| ProtocolError::Json { event, source })
}

fn from_json<T: DeserializeOwned>(event: EventName, payload: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(payload).map_err(|source| ProtocolError::Json { event, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, InfoMessage, MessageStatus};

    #[test]
    fn test_encode_layout() {
        let frame = Frame::Send(ChatMessage::new("alice", "bob", "hello there"));
        let encoded = encode(&frame).unwrap();
        let (name, payload) = encoded.split_once(' ').unwrap();
        assert_eq!(name, "send");
        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["text"], "hello there");
    }

    #[test]
    fn test_decode_splits_on_first_space() {
        let data = r#"send {"sender_id":"alice","recipient_id":"bob","text":"a b c"}"#;
        match decode(data).unwrap() {
            Frame::Send(msg) => {
                assert_eq!(msg.sender_id, "alice");
                assert_eq!(msg.text, "a b c");
            }
            other => panic!("Expected Send frame, got {:?}", other),
        }
    }

    #[test]
    fn test_send_failed_without_payload() {
        let encoded = encode(&Frame::send_failed()).unwrap();
        assert_eq!(encoded, "sendFailed null");
        assert_eq!(decode(&encoded).unwrap(), Frame::SendFailed(None));
    }

    #[test]
    fn test_info_roundtrip() {
        let frame = Frame::Info(InfoMessage::new("maintenance", "back soon", "ops"));
        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_decode_missing_separator() {
        match decode("send") {
            Err(ProtocolError::MissingSeparator) => {}
            other => panic!("Expected MissingSeparator error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_event() {
        match decode("subscribe {}") {
            Err(ProtocolError::UnknownEvent(name)) => assert_eq!(name, "subscribe"),
            other => panic!("Expected UnknownEvent error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_bad_payload() {
        match decode("read [1,2,3]") {
            Err(ProtocolError::Json { event, .. }) => assert_eq!(event, EventName::Read),
            other => panic!("Expected Json error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let data = format!("send {}", "x".repeat(MAX_FRAME_SIZE));

        match decode(&data) {
            Err(ProtocolError::FrameTooLarge(size)) => assert_eq!(size, data.len()),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_largest_send_reply_still_encodes() {
        let empty = encode(&Frame::Send(ChatMessage::new("alice", "bob", ""))).unwrap();
        let text = "x".repeat(MAX_FRAME_SIZE - empty.len());
        let inbound = encode(&Frame::Send(ChatMessage::new("alice", "bob", text))).unwrap();
        assert_eq!(inbound.len(), MAX_FRAME_SIZE);

        let Frame::Send(mut message) = decode(&inbound).unwrap() else {
            panic!("Expected Send frame");
        };
        message.id = "37c37153-089e-4c19-466e-2f467ac07c1e".to_string();
        message.sent_at = Some(chrono::Utc::now());
        message.received_at = Some(chrono::Utc::now());
        message.sender_name = "Alice Liddell".to_string();
        message.status = MessageStatus::Delivered;

        for reply in [Frame::SendSuccess(message.clone()), Frame::Receive(message)] {
            let encoded = encode(&reply).unwrap();
            assert!(encoded.len() > MAX_FRAME_SIZE);
        }
    }
}
