//! Session lookup for the upgrade handshake.
//!
//! Issuing sessions belongs to the surrounding application. The messenger
//! only needs to turn a request's headers into an authenticated identity.

use crate::storage::{Storage, StorageError, StorageProvider};
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default session cookie name.
pub const DEFAULT_COOKIE_NAME: &str = "aurora";

/// Storage unit and bucket holding session records.
///
/// The unit name carries the reserved prefix, so no user's mailbox can share
/// it.
pub const SESSIONS_UNIT: &str = "_sessions";
const SESSIONS_BUCKET: &str = "sessions";

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User (and profile) ID.
    pub user_id: String,
    /// Name shown to other users.
    pub display_name: String,
}

impl Identity {
    /// Create an identity.
    #[must_use]
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Resolves the authenticated user behind a request.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Returns the identity if the request carries a valid, unexpired
    /// session.
    async fn validate(&self, headers: &HeaderMap) -> Option<Identity>;
}

/// A stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Owner of the session.
    pub user_id: String,
    /// Display name of the owner.
    #[serde(default)]
    pub display_name: String,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Check whether the session has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Sessions kept in a storage unit, keyed by the session cookie value.
pub struct StoredSessions {
    storage: Arc<dyn Storage>,
    cookie_name: String,
}

impl StoredSessions {
    /// Open the session store on a provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the sessions unit cannot be opened.
    pub async fn open(
        provider: &dyn StorageProvider,
        cookie_name: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let storage = provider.open(SESSIONS_UNIT).await?;
        Ok(Self::new(storage, cookie_name))
    }

    /// Use an already opened storage unit as the session store.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, cookie_name: impl Into<String>) -> Self {
        Self {
            storage,
            cookie_name: cookie_name.into(),
        }
    }

    /// Name of the cookie carrying the session ID.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Store a session record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub async fn insert(&self, session_id: &str, record: &SessionRecord) -> Result<(), StorageError> {
        let data =
            serde_json::to_vec(record).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.storage.create(&[SESSIONS_BUCKET], session_id, data).await
    }

    /// Remove a session record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be deleted.
    pub async fn remove(&self, session_id: &str) -> Result<(), StorageError> {
        self.storage.delete(&[SESSIONS_BUCKET], session_id).await
    }

    async fn lookup(&self, session_id: &str) -> Option<SessionRecord> {
        let data = match self.storage.get(&[SESSIONS_BUCKET], session_id).await {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                return None;
            }
        };

        match serde_json::from_slice(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Corrupt session record");
                None
            }
        }
    }
}

#[async_trait]
impl SessionValidator for StoredSessions {
    async fn validate(&self, headers: &HeaderMap) -> Option<Identity> {
        let Some(session_id) = cookie_value(headers, &self.cookie_name) else {
            debug!("Handshake without session cookie");
            return None;
        };

        let record = self.lookup(&session_id).await?;
        if record.is_expired() {
            debug!(user = %record.user_id, "Handshake with expired session");
            return None;
        }

        Some(Identity::new(record.user_id, record.display_name))
    }
}

/// Extract a cookie value from request headers.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryProvider;
    use axum::http::HeaderValue;
    use chrono::Duration;

    fn headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    fn record(user: &str, ttl: Duration) -> SessionRecord {
        SessionRecord {
            user_id: user.to_string(),
            display_name: format!("{user} tester"),
            expires_at: Utc::now() + ttl,
        }
    }

    #[test]
    fn test_cookie_value() {
        let h = headers("theme=dark; aurora=abc123; other=x");
        assert_eq!(cookie_value(&h, "aurora"), Some("abc123".to_string()));
        assert_eq!(cookie_value(&h, "missing"), None);
        assert_eq!(cookie_value(&headers("aurora="), "aurora"), None);
        assert_eq!(cookie_value(&HeaderMap::new(), "aurora"), None);
    }

    #[tokio::test]
    async fn test_valid_session() {
        let provider = MemoryProvider::new();
        let sessions = StoredSessions::open(&provider, DEFAULT_COOKIE_NAME)
            .await
            .unwrap();
        sessions
            .insert("abc", &record("alice", Duration::hours(1)))
            .await
            .unwrap();

        let identity = sessions.validate(&headers("aurora=abc")).await.unwrap();
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.display_name, "alice tester");
    }

    #[tokio::test]
    async fn test_missing_unknown_and_expired() {
        let provider = MemoryProvider::new();
        let sessions = StoredSessions::open(&provider, DEFAULT_COOKIE_NAME)
            .await
            .unwrap();
        sessions
            .insert("old", &record("alice", Duration::hours(-1)))
            .await
            .unwrap();

        assert!(sessions.validate(&HeaderMap::new()).await.is_none());
        assert!(sessions.validate(&headers("aurora=nope")).await.is_none());
        assert!(sessions.validate(&headers("aurora=old")).await.is_none());
    }

    #[tokio::test]
    async fn test_removed_session() {
        let provider = MemoryProvider::new();
        let sessions = StoredSessions::open(&provider, "sid").await.unwrap();
        sessions
            .insert("abc", &record("bob", Duration::hours(1)))
            .await
            .unwrap();
        sessions.remove("abc").await.unwrap();

        assert!(sessions.validate(&headers("sid=abc")).await.is_none());
    }

    #[tokio::test]
    async fn test_sessions_outside_user_units() {
        let provider = MemoryProvider::new();
        let sessions = StoredSessions::open(&provider, DEFAULT_COOKIE_NAME)
            .await
            .unwrap();
        sessions
            .insert("abc", &record("alice", Duration::hours(1)))
            .await
            .unwrap();

        // A user literally named "sessions" gets a unit of its own.
        let user = provider.open("sessions").await.unwrap();
        assert!(user.list(&[SESSIONS_BUCKET]).await.unwrap().is_empty());
        assert!(crate::storage::validate_user_unit(SESSIONS_UNIT).is_err());
    }
}
