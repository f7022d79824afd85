//! # aurora-protocol
//!
//! Wire protocol definitions for the Aurora direct messenger.
//!
//! Every frame is UTF-8 text of the form `<event> <json payload>`, carried
//! one frame per transport message.
//!
//! ## Events
//!
//! - `send` / `read` / `info` - Client requests
//! - `receive` - Live push to a recipient
//! - `sendSuccess` / `sendFailed` / `messageInbox` / `messageRead` - Alerts
//!
//! ## Example
//!
//! ```rust
//! use aurora_protocol::{codec, ChatMessage, Frame};
//!
//! let frame = Frame::Send(ChatMessage::new("alice", "bob", "hi"));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! assert!(encoded.starts_with("send "));
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod message;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{EventName, Frame};
pub use message::{ChatMessage, InfoMessage, MessageStatus};
