//! Durable per-user mailboxes.
//!
//! A message's bucket is its lifecycle state: `outbox` on the sender's side
//! once accepted, `inbox` on the recipient's side once landed, `read` after
//! acknowledgement, and `drafts` after a failed delivery. Buckets live in a
//! container bucket (default `messages`) inside the user's own storage unit.

use crate::storage::{validate_user_unit, Storage, StorageError, StorageProvider};
use aurora_protocol::ChatMessage;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Default name of the container bucket holding the mailbox buckets.
pub const DEFAULT_CONTAINER: &str = "messages";

/// Mailbox buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Accepted from the sender.
    Outbox,
    /// Landed at the recipient.
    Inbox,
    /// Failed sends, returned to the sender.
    Drafts,
    /// Acknowledged by the recipient.
    Read,
}

impl Bucket {
    /// Storage name of the bucket.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Bucket::Outbox => "outbox",
            Bucket::Inbox => "inbox",
            Bucket::Drafts => "drafts",
            Bucket::Read => "read",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mailbox errors.
#[derive(Debug, Error)]
pub enum MailboxError {
    /// The storage layer failed.
    #[error("Storage failure: {0}")]
    StorageFailure(#[from] StorageError),

    /// The message is not in the expected bucket.
    #[error("Message {id} not found in {bucket}")]
    NotFound {
        /// Bucket that was searched.
        bucket: Bucket,
        /// Message ID.
        id: String,
    },

    /// A record could not be (de)serialized.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Factory for per-user mailboxes.
///
/// Mailboxes handed out for the same user share one lock, which serializes
/// every write to that user's storage unit across connections. A lock lives
/// only as long as some mailbox of its user does.
pub struct Mailboxes {
    provider: Arc<dyn StorageProvider>,
    container: Arc<str>,
    locks: Arc<LockMap>,
}

type LockMap = DashMap<String, Arc<Mutex<()>>>;

impl Mailboxes {
    /// Create a factory over a storage provider.
    #[must_use]
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self::with_container(provider, DEFAULT_CONTAINER)
    }

    /// Create a factory with a custom container bucket name.
    #[must_use]
    pub fn with_container(provider: Arc<dyn StorageProvider>, container: &str) -> Self {
        Self {
            provider,
            container: Arc::from(container),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Number of users with a mailbox currently open.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Open the mailbox of a user.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the user ID names a reserved unit or the
    /// user's storage unit cannot be opened.
    pub async fn for_user(&self, user_id: &str) -> Result<Mailbox, MailboxError> {
        validate_user_unit(user_id)?;
        let storage = self.provider.open(user_id).await?;
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        Ok(Mailbox {
            user_id: user_id.to_string(),
            storage,
            container: Arc::clone(&self.container),
            lock,
            locks: Arc::clone(&self.locks),
        })
    }
}

/// A scoped accessor to one user's mailbox.
pub struct Mailbox {
    user_id: String,
    storage: Arc<dyn Storage>,
    container: Arc<str>,
    lock: Arc<Mutex<()>>,
    locks: Arc<LockMap>,
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // The map and this mailbox hold two references; a third is another
        // mailbox of the same user.
        self.locks.remove_if(&self.user_id, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

impl Mailbox {
    /// Owner of the mailbox.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn path(&self, bucket: Bucket) -> [&str; 2] {
        [&*self.container, bucket.as_str()]
    }

    /// Persist a message into a bucket.
    ///
    /// Assigns a fresh ID if the message has none. The ID is never changed
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the write fails.
    pub async fn save(&self, bucket: Bucket, message: &mut ChatMessage) -> Result<(), MailboxError> {
        if !message.has_id() {
            message.id = uuid::Uuid::new_v4().to_string();
        }
        let data = serde_json::to_vec(message)?;

        let _guard = self.lock.lock().await;
        self.storage
            .create(&self.path(bucket), &message.id, data)
            .await?;

        debug!(user = %self.user_id, bucket = %bucket, id = %message.id, "Saved message");
        Ok(())
    }

    /// Move a message from `src` to `dest`, keeping its bytes and ID.
    ///
    /// Whether the move is atomic depends on the storage backend. Without
    /// transactions a fault between the write and the delete leaves the
    /// message in both buckets.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `src` does not hold the message, and
    /// `StorageFailure` if the storage layer fails.
    pub async fn move_to(&self, dest: Bucket, src: Bucket, id: &str) -> Result<(), MailboxError> {
        let _guard = self.lock.lock().await;
        let moved = self
            .storage
            .move_value(&self.path(src), &self.path(dest), id)
            .await?;

        if !moved {
            return Err(MailboxError::NotFound {
                bucket: src,
                id: id.to_string(),
            });
        }

        debug!(user = %self.user_id, from = %src, to = %dest, id = %id, "Moved message");
        Ok(())
    }

    /// Remove a message from a bucket.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the delete fails.
    pub async fn delete(&self, bucket: Bucket, id: &str) -> Result<(), MailboxError> {
        let _guard = self.lock.lock().await;
        self.storage.delete(&self.path(bucket), id).await?;
        trace!(user = %self.user_id, bucket = %bucket, id = %id, "Deleted message");
        Ok(())
    }

    /// Read the raw stored record.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the read fails.
    pub async fn get_raw(&self, bucket: Bucket, id: &str) -> Result<Option<Vec<u8>>, MailboxError> {
        Ok(self.storage.get(&self.path(bucket), id).await?)
    }

    /// Read a message.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the read fails or `Codec` if the record
    /// is corrupt.
    pub async fn get(&self, bucket: Bucket, id: &str) -> Result<Option<ChatMessage>, MailboxError> {
        match self.get_raw(bucket, id).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Read every message in a bucket.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the read fails or `Codec` if a record is
    /// corrupt.
    pub async fn list(&self, bucket: Bucket) -> Result<Vec<ChatMessage>, MailboxError> {
        self.storage
            .list(&self.path(bucket))
            .await?
            .into_iter()
            .map(|(_, data)| serde_json::from_slice(&data).map_err(MailboxError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryProvider;
    use async_trait::async_trait;

    /// Storage whose deletes always fail.
    struct NoDelete {
        inner: Arc<dyn Storage>,
    }

    #[async_trait]
    impl Storage for NoDelete {
        async fn get(&self, buckets: &[&str], key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(buckets, key).await
        }

        async fn create(
            &self,
            buckets: &[&str],
            key: &str,
            value: Vec<u8>,
        ) -> Result<(), StorageError> {
            self.inner.create(buckets, key, value).await
        }

        async fn update(
            &self,
            buckets: &[&str],
            key: &str,
            value: Vec<u8>,
        ) -> Result<(), StorageError> {
            self.inner.update(buckets, key, value).await
        }

        async fn delete(&self, _buckets: &[&str], _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("disk detached".into()))
        }

        async fn list(&self, buckets: &[&str]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
            self.inner.list(buckets).await
        }
    }

    struct NoDeleteProvider(MemoryProvider);

    #[async_trait]
    impl StorageProvider for NoDeleteProvider {
        async fn open(&self, unit: &str) -> Result<Arc<dyn Storage>, StorageError> {
            Ok(Arc::new(NoDelete {
                inner: self.0.open(unit).await?,
            }))
        }
    }

    fn mailboxes() -> (Arc<MemoryProvider>, Mailboxes) {
        let provider = Arc::new(MemoryProvider::new());
        let mailboxes = Mailboxes::new(provider.clone());
        (provider, mailboxes)
    }

    #[tokio::test]
    async fn test_save_assigns_id_once() {
        let (_, mailboxes) = mailboxes();
        let outbox = mailboxes.for_user("alice").await.unwrap();
        let mut msg = ChatMessage::new("alice", "bob", "hi");

        outbox.save(Bucket::Outbox, &mut msg).await.unwrap();
        assert!(msg.has_id());
        let id = msg.id.clone();

        outbox.save(Bucket::Outbox, &mut msg).await.unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(outbox.list(Bucket::Outbox).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_keeps_existing_id() {
        let (_, mailboxes) = mailboxes();
        let inbox = mailboxes.for_user("bob").await.unwrap();
        let mut msg = ChatMessage::new("alice", "bob", "hi").with_id("fixed");

        inbox.save(Bucket::Inbox, &mut msg).await.unwrap();
        assert_eq!(msg.id, "fixed");
        assert!(inbox.get(Bucket::Inbox, "fixed").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_then_raw_get_roundtrip() {
        let (provider, mailboxes) = mailboxes();
        let mailbox = mailboxes.for_user("alice").await.unwrap();
        let original = ChatMessage::new("alice", "bob", "hello");
        let mut msg = original.clone();

        mailbox.save(Bucket::Outbox, &mut msg).await.unwrap();

        let raw = provider
            .open("alice")
            .await
            .unwrap()
            .get(&["messages", "outbox"], &msg.id)
            .await
            .unwrap()
            .unwrap();
        let stored: ChatMessage = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored, original.with_id(msg.id.clone()));
    }

    #[tokio::test]
    async fn test_move_preserves_bytes() {
        let (_, mailboxes) = mailboxes();
        let mailbox = mailboxes.for_user("bob").await.unwrap();
        let mut msg = ChatMessage::new("alice", "bob", "hi");
        mailbox.save(Bucket::Inbox, &mut msg).await.unwrap();
        let before = mailbox.get_raw(Bucket::Inbox, &msg.id).await.unwrap();

        mailbox.move_to(Bucket::Read, Bucket::Inbox, &msg.id).await.unwrap();

        assert_eq!(mailbox.get_raw(Bucket::Inbox, &msg.id).await.unwrap(), None);
        assert_eq!(mailbox.get_raw(Bucket::Read, &msg.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_move_missing_is_not_found() {
        let (_, mailboxes) = mailboxes();
        let mailbox = mailboxes.for_user("bob").await.unwrap();

        match mailbox.move_to(Bucket::Read, Bucket::Inbox, "nope").await {
            Err(MailboxError::NotFound { bucket, id }) => {
                assert_eq!(bucket, Bucket::Inbox);
                assert_eq!(id, "nope");
            }
            other => panic!("Expected NotFound error, got {:?}", other),
        }
        assert!(mailbox.list(Bucket::Read).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_, mailboxes) = mailboxes();
        let mailbox = mailboxes.for_user("alice").await.unwrap();
        let mut msg = ChatMessage::new("alice", "bob", "hi");
        mailbox.save(Bucket::Drafts, &mut msg).await.unwrap();

        mailbox.delete(Bucket::Drafts, &msg.id).await.unwrap();
        assert!(mailbox.get(Bucket::Drafts, &msg.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_custom_container() {
        let provider = Arc::new(MemoryProvider::new());
        let mailboxes = Mailboxes::with_container(provider.clone(), "mail");
        let mailbox = mailboxes.for_user("alice").await.unwrap();
        let mut msg = ChatMessage::new("alice", "bob", "hi");
        mailbox.save(Bucket::Outbox, &mut msg).await.unwrap();

        let unit = provider.open("alice").await.unwrap();
        assert!(unit.get(&["mail", "outbox"], &msg.id).await.unwrap().is_some());
        assert!(unit.get(&["messages", "outbox"], &msg.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_with_failed_delete_keeps_both_copies() {
        let mailboxes = Mailboxes::new(Arc::new(NoDeleteProvider(MemoryProvider::new())));
        let mailbox = mailboxes.for_user("bob").await.unwrap();
        let mut msg = ChatMessage::new("alice", "bob", "hi");
        mailbox.save(Bucket::Inbox, &mut msg).await.unwrap();

        match mailbox.move_to(Bucket::Read, Bucket::Inbox, &msg.id).await {
            Err(MailboxError::StorageFailure(StorageError::Backend(_))) => {}
            other => panic!("Expected StorageFailure error, got {:?}", other),
        }

        let inbox = mailbox.get_raw(Bucket::Inbox, &msg.id).await.unwrap();
        assert!(inbox.is_some());
        assert_eq!(mailbox.get_raw(Bucket::Read, &msg.id).await.unwrap(), inbox);
    }

    #[tokio::test]
    async fn test_locks_released_with_last_mailbox() {
        let (_, mailboxes) = mailboxes();
        let first = mailboxes.for_user("alice").await.unwrap();
        let second = mailboxes.for_user("alice").await.unwrap();
        let bob = mailboxes.for_user("bob").await.unwrap();
        assert_eq!(mailboxes.lock_count(), 2);

        drop(first);
        assert_eq!(mailboxes.lock_count(), 2);
        drop(second);
        drop(bob);
        assert_eq!(mailboxes.lock_count(), 0);

        for i in 0..100 {
            let mailbox = mailboxes.for_user(&format!("user-{i}")).await.unwrap();
            let mut msg = ChatMessage::new("alice", mailbox.user_id(), "hi");
            mailbox.save(Bucket::Inbox, &mut msg).await.unwrap();
        }
        assert_eq!(mailboxes.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_reserved_unit_is_not_a_mailbox() {
        let (provider, mailboxes) = mailboxes();

        match mailboxes.for_user("_sessions").await {
            Err(MailboxError::StorageFailure(StorageError::InvalidPath(_))) => {}
            other => panic!("Expected InvalidPath error, got {:?}", other.map(|m| m.user_id().to_string())),
        }
        assert_eq!(provider.unit_count(), 0);
    }

    #[test]
    fn test_bucket_names() {
        assert_eq!(Bucket::Outbox.to_string(), "outbox");
        assert_eq!(Bucket::Drafts.as_str(), "drafts");
    }
}
