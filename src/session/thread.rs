//! Conversation thread and session storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::llm::{Message, MessageRole};

/// Default session timeout (30 minutes).
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A single conversation session.
///
/// Sessions maintain the append-only message history. The message log is
/// never reordered; the first message, once present, is the system prompt.
#[derive(Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    /// Unique session identifier.
    id: String,
    /// Conversation messages, append-only.
    messages: RwLock<Vec<Message>>,
    /// Session creation time.
    created_at: DateTime<Utc>,
    /// Last activity time.
    last_activity: RwLock<DateTime<Utc>>,
    /// Serializes chat turns: at most one orchestrated turn may be in
    /// flight per conversation identity.
    turn_lock: Arc<Mutex<()>>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Session {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                id,
                messages: RwLock::new(Vec::new()),
                created_at: now,
                last_activity: RwLock::new(now),
                turn_lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Acquire the turn lock for the duration of one chat turn.
    ///
    /// Concurrent turns over the same conversation queue here instead of
    /// interleaving their appends.
    pub async fn begin_turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner.turn_lock).lock_owned().await
    }

    /// Insert a system message at index 0 unless one is already there.
    pub fn ensure_system(&self, prompt: &str) {
        let mut guard = self.inner.messages.write().unwrap();
        let has_system = guard.first().is_some_and(|m| m.role == MessageRole::System);
        if !has_system {
            guard.insert(0, Message::text(MessageRole::System, prompt));
        }
        drop(guard);
        self.touch();
    }

    /// Add a user message to the conversation.
    pub fn add_user_message(&self, content: impl Into<String>) {
        self.add_message(Message::text(MessageRole::User, content));
    }

    /// Append a message to the conversation.
    pub fn add_message(&self, message: Message) {
        let mut guard = self.inner.messages.write().unwrap();
        guard.push(message);
        drop(guard);
        self.touch();
    }

    /// Get all messages in the conversation.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.read().unwrap().clone()
    }

    /// Get the number of messages in the conversation.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.messages.read().unwrap().len()
    }

    /// Update the last activity timestamp.
    fn touch(&self) {
        let mut guard = self.inner.last_activity.write().unwrap();
        *guard = Utc::now();
    }

    /// Check if the session has been inactive longer than the timeout.
    #[must_use]
    pub fn is_expired_with_timeout(&self, timeout: Duration) -> bool {
        let last = *self.inner.last_activity.read().unwrap();
        let now = Utc::now();
        if let Ok(duration) = (now - last).to_std() {
            duration > timeout
        } else {
            // Negative duration means clock skew or "last" is in future.
            false
        }
    }

    /// Get the session age.
    #[must_use]
    pub fn age(&self) -> Duration {
        let now = Utc::now();
        (now - self.inner.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }
}

/// Thread-safe store for sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

#[derive(Debug)]
struct SessionStoreInner {
    sessions: RwLock<HashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create a new session store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create a new session and return it.
    #[must_use]
    pub fn create(&self) -> Session {
        let id = Uuid::new_v4().to_string();
        self.create_with_id(id)
    }

    /// Create a new session with a specific ID.
    #[must_use]
    pub fn create_with_id(&self, id: impl Into<String>) -> Session {
        let id = id.into();
        let session = Session::new(id.clone());
        let mut guard = self.inner.sessions.write().unwrap();
        guard.insert(id, session.clone());
        session
    }

    /// Get a session by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        let guard = self.inner.sessions.read().unwrap();
        guard.get(id).cloned()
    }

    /// Get a session by ID, creating it if it doesn't exist.
    #[must_use]
    pub fn get_or_create(&self, id: &str) -> Session {
        // Try read-only first
        {
            let guard = self.inner.sessions.read().unwrap();
            if let Some(session) = guard.get(id) {
                return session.clone();
            }
        }

        // Create if not exists
        self.create_with_id(id)
    }

    /// Remove a session by ID.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let mut guard = self.inner.sessions.write().unwrap();
        guard.remove(id)
    }

    /// Get the number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.read().unwrap().len()
    }

    /// Check if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all expired sessions.
    ///
    /// Returns the number of sessions removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_with_timeout(DEFAULT_SESSION_TIMEOUT)
    }

    /// Remove sessions that have been inactive longer than the timeout.
    pub fn cleanup_expired_with_timeout(&self, timeout: Duration) -> usize {
        let mut guard = self.inner.sessions.write().unwrap();
        let before = guard.len();
        guard.retain(|_, session| !session.is_expired_with_timeout(timeout));
        before - guard.len()
    }
}
