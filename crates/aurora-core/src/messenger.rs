//! The delivery state machine.
//!
//! The messenger interprets frames read from a client and deliveries queued
//! on a connection by room emits. Both entry points return the frames to
//! write back on that connection. Nothing in here is connection-fatal:
//! storage failures become `sendFailed` alerts or log lines.

use crate::connection::{Delivery, DeliveryReceiver};
use crate::lifecycle::{Connection, Lifecycle};
use crate::mailbox::{Bucket, MailboxError, Mailboxes, DEFAULT_CONTAINER};
use crate::presence::PresenceCache;
use crate::room::{personal_room, GLOBAL_ROOM};
use crate::room_manager::{RoomError, RoomManager};
use crate::session::{Identity, SessionValidator};
use crate::storage::StorageProvider;
use aurora_protocol::{ChatMessage, Frame, InfoMessage, MessageStatus};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Messenger errors.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// The handshake carried no valid session.
    #[error("Authentication required")]
    AuthenticationRequired,

    /// The declared sender is not the authenticated user.
    #[error("Declared sender {declared} does not match authenticated user {actual}")]
    SpoofedSender {
        /// Sender ID claimed by the message.
        declared: String,
        /// User bound to the connection.
        actual: String,
    },

    /// Mailbox error.
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// Room error.
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// What to do with a `send` whose declared sender is not the connection's
/// user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoofPolicy {
    /// Drop silently.
    #[default]
    Drop,
    /// Reply `sendFailed` carrying the rejected message.
    Reject,
}

/// Messenger configuration.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Handling of spoofed senders.
    pub spoof_policy: SpoofPolicy,
    /// Container bucket holding the mailbox buckets.
    pub container: String,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            spoof_policy: SpoofPolicy::default(),
            container: DEFAULT_CONTAINER.to_string(),
        }
    }
}

/// The message router.
pub struct Messenger {
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceCache>,
    mailboxes: Mailboxes,
    lifecycle: Lifecycle,
    config: MessengerConfig,
}

impl Messenger {
    /// Create a messenger over a storage provider and a session validator.
    #[must_use]
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        sessions: Arc<dyn SessionValidator>,
        config: MessengerConfig,
    ) -> Self {
        let rooms = Arc::new(RoomManager::new());
        let presence = Arc::new(PresenceCache::new());
        let lifecycle = Lifecycle::new(sessions, Arc::clone(&rooms), Arc::clone(&presence));
        let mailboxes = Mailboxes::with_container(provider, &config.container);

        info!(spoof_policy = ?config.spoof_policy, container = %config.container, "Creating messenger");

        Self {
            rooms,
            presence,
            mailboxes,
            lifecycle,
            config,
        }
    }

    /// Get the room manager.
    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Get the presence cache.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceCache> {
        &self.presence
    }

    /// Get the mailbox factory.
    #[must_use]
    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    /// Validate an upgrade request.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationRequired` if the request has no valid session.
    pub async fn handshake(&self, headers: &HeaderMap) -> Result<Identity, MessengerError> {
        self.lifecycle.handshake(headers).await
    }

    /// Register an authenticated connection.
    ///
    /// # Errors
    ///
    /// Returns a room error if the user ID cannot name a room.
    pub fn connect(&self, identity: Identity) -> Result<(Connection, DeliveryReceiver), MessengerError> {
        self.lifecycle.connect(identity)
    }

    /// Handle a frame read from the client.
    pub async fn handle_frame(&self, conn: &Connection, frame: Frame) -> Vec<Frame> {
        match frame {
            Frame::Send(message) => self.on_send(conn, message).await,
            Frame::Read(message) => self.on_read(conn, message).await,
            Frame::Info(info) => self.on_info(conn, info),
            Frame::Receive(message) => {
                if message.recipient_id != conn.user_id() {
                    warn!(
                        user = %conn.user_id(),
                        recipient = %message.recipient_id,
                        "Dropping receive for another user"
                    );
                    return Vec::new();
                }
                self.on_receive(conn, message).await
            }
            Frame::SendFailed(Some(message)) => {
                if let Err(e) = check_sender(conn, &message) {
                    warn!(error = %e, "Dropping sendFailed for another user");
                    return Vec::new();
                }
                self.on_send_failed(conn, &message).await
            }
            Frame::SendFailed(None) => {
                debug!(user = %conn.user_id(), "Dropping sendFailed without message");
                Vec::new()
            }
            alert @ (Frame::SendSuccess(_) | Frame::MessageInbox(_) | Frame::MessageRead(_)) => {
                debug!(user = %conn.user_id(), event = %alert.event(), "Dropping alert from client");
                Vec::new()
            }
        }
    }

    /// Handle a delivery queued on the connection by a room emit.
    pub async fn handle_delivery(&self, conn: &Connection, delivery: &Delivery) -> Vec<Frame> {
        match delivery {
            Delivery::Receive(message) => self.on_receive(conn, message.clone()).await,
            Delivery::SendFailed(message) => self.on_send_failed(conn, message).await,
            Delivery::Info(info) => vec![Frame::Info(info.clone())],
        }
    }

    /// Persist the deliveries still queued on a closed connection.
    ///
    /// A live push is acknowledged to its sender as soon as it is queued, so
    /// whatever the socket never got to must still land in the mailbox.
    /// Receives are saved to the inbox and failure reports draft the
    /// message; the reply frames are discarded. Call after
    /// [`Connection::close`], once nothing can be queued any more.
    ///
    /// Returns the number of deliveries persisted.
    pub async fn drain(&self, conn: &Connection, deliveries: &mut DeliveryReceiver) -> usize {
        let mut drained = 0;
        while let Ok(delivery) = deliveries.try_recv() {
            if let Delivery::Info(_) = *delivery {
                continue;
            }
            self.handle_delivery(conn, &delivery).await;
            drained += 1;
        }
        drained
    }

    async fn on_send(&self, conn: &Connection, mut message: ChatMessage) -> Vec<Frame> {
        if let Err(e) = check_sender(conn, &message) {
            warn!(error = %e, policy = ?self.config.spoof_policy, "Spoofed sender");
            return match self.config.spoof_policy {
                SpoofPolicy::Drop => Vec::new(),
                SpoofPolicy::Reject => vec![Frame::send_failed_with(message)],
            };
        }

        message.sent_at = Some(Utc::now());
        message.sender_name = conn.identity().display_name.clone();
        message.status = MessageStatus::Pending;

        if let Err(e) = self.save(conn.user_id(), Bucket::Outbox, &mut message).await {
            error!(user = %conn.user_id(), error = %e, "Failed to save to outbox");
            message.status = MessageStatus::Failed;
            return vec![Frame::send_failed_with(message)];
        }

        let recipient = message.recipient_id.clone();
        if self.presence.exists(&recipient) {
            message.status = MessageStatus::Delivered;
            let pushed = self
                .rooms
                .emit(&personal_room(&recipient), Delivery::Receive(message.clone()));
            if pushed > 0 {
                debug!(id = %message.id, recipient = %recipient, connections = pushed, "Pushed live");
                return vec![Frame::SendSuccess(message)];
            }
            // Presence is a hint; the recipient left between the check and the emit.
            debug!(id = %message.id, recipient = %recipient, "Recipient gone, queueing");
        }

        message.status = MessageStatus::Queued;
        match self.save(&recipient, Bucket::Inbox, &mut message).await {
            Ok(()) => {
                debug!(id = %message.id, recipient = %recipient, "Queued in inbox");
                vec![Frame::SendSuccess(message)]
            }
            Err(e) => {
                error!(id = %message.id, recipient = %recipient, error = %e, "Failed to queue in inbox");
                message.status = MessageStatus::Failed;
                vec![Frame::send_failed_with(message)]
            }
        }
    }

    async fn on_receive(&self, conn: &Connection, mut message: ChatMessage) -> Vec<Frame> {
        message.received_at = Some(Utc::now());
        message.status = MessageStatus::Received;

        match self.save(conn.user_id(), Bucket::Inbox, &mut message).await {
            Ok(()) => vec![Frame::Receive(message.clone()), Frame::MessageInbox(message)],
            Err(e) => {
                error!(user = %conn.user_id(), id = %message.id, error = %e, "Failed to save received message");
                message.status = MessageStatus::Failed;
                self.report_failed_receive(message).await;
                Vec::new()
            }
        }
    }

    /// Tell the sender a message did not land, or draft it directly if the
    /// sender has no live connection to do so.
    async fn report_failed_receive(&self, message: ChatMessage) {
        let sender = message.sender_id.clone();
        if self.presence.exists(&sender) {
            let notified = self
                .rooms
                .emit(&personal_room(&sender), Delivery::SendFailed(message.clone()));
            if notified > 0 {
                return;
            }
        }

        debug!(id = %message.id, sender = %sender, "Sender offline, drafting directly");
        if let Err(e) = self.draft(&sender, &message.id).await {
            warn!(id = %message.id, sender = %sender, error = %e, "Failed to draft message");
        }
    }

    async fn on_send_failed(&self, conn: &Connection, message: &ChatMessage) -> Vec<Frame> {
        match self.draft(conn.user_id(), &message.id).await {
            Ok(()) => {}
            // Another device of the same user already drafted it.
            Err(MessengerError::Mailbox(MailboxError::NotFound { .. })) => {
                debug!(user = %conn.user_id(), id = %message.id, "Already drafted");
            }
            Err(e) => {
                warn!(user = %conn.user_id(), id = %message.id, error = %e, "Failed to draft message");
            }
        }
        vec![Frame::send_failed()]
    }

    async fn on_read(&self, conn: &Connection, message: ChatMessage) -> Vec<Frame> {
        let result = match self.mailboxes.for_user(conn.user_id()).await {
            Ok(mailbox) => mailbox.move_to(Bucket::Read, Bucket::Inbox, &message.id).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(MailboxError::NotFound { .. }) => {
                warn!(user = %conn.user_id(), id = %message.id, "Read acknowledgement for unknown message");
            }
            Err(e) => {
                error!(user = %conn.user_id(), id = %message.id, error = %e, "Failed to mark message read");
            }
        }
        vec![Frame::MessageRead(message)]
    }

    fn on_info(&self, conn: &Connection, mut info: InfoMessage) -> Vec<Frame> {
        if info.sender.is_empty() {
            info.sender = conn.identity().display_name.clone();
        }
        let count = self.rooms.emit(GLOBAL_ROOM, Delivery::Info(info));
        debug!(user = %conn.user_id(), recipients = count, "Broadcast info");
        // The sender is a member of the global room and gets its own copy.
        Vec::new()
    }

    async fn save(
        &self,
        user_id: &str,
        bucket: Bucket,
        message: &mut ChatMessage,
    ) -> Result<(), MessengerError> {
        let mailbox = self.mailboxes.for_user(user_id).await?;
        mailbox.save(bucket, message).await?;
        Ok(())
    }

    async fn draft(&self, user_id: &str, id: &str) -> Result<(), MessengerError> {
        let mailbox = self.mailboxes.for_user(user_id).await?;
        mailbox.move_to(Bucket::Drafts, Bucket::Outbox, id).await?;
        Ok(())
    }
}

fn check_sender(conn: &Connection, message: &ChatMessage) -> Result<(), MessengerError> {
    if message.sender_id == conn.user_id() {
        Ok(())
    } else {
        Err(MessengerError::SpoofedSender {
            declared: message.sender_id.clone(),
            actual: conn.user_id().to_string(),
        })
    }
}
