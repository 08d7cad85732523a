//! Durable, ordered collection of conversations.
//!
//! The whole collection is one JSON value under a single storage key and is
//! flushed after every mutation. Persistence failures are warnings: memory
//! stays authoritative for the rest of the process, and the next successful
//! flush catches the store file back up.

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::message::{Message, Role};
use crate::core::persistence::KeyValueStore;

/// Storage key the session collection is persisted under.
pub const SESSIONS_KEY: &str = "sessions";

/// Title shown for a session with no user message yet.
pub const UNTITLED_SESSION: &str = "New Chat";

/// Characters of the first user message kept before the ellipsis.
const TITLE_KEEP_CHARS: usize = 41;

/// One persisted conversation. Newest sessions sit at the front of the
/// collection. The title is derived on demand, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: next_session_id(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionCollection {
    pub sessions: Vec<Session>,
    pub active: Option<u64>,
}

/// A write-style operation referenced a session that is no longer in the
/// collection (deleted out from under an in-flight turn, typically).
#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    SessionNotFound { id: u64 },
    NoAssistantTail { id: u64 },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::SessionNotFound { id } => {
                write!(f, "session {id} is not in the collection")
            }
            StoreError::NoAssistantTail { id } => {
                write!(f, "session {id} has no streaming assistant message to update")
            }
        }
    }
}

impl StdError for StoreError {}

/// Session ids are milliseconds-since-epoch, bumped past the previous id
/// when two sessions land in the same millisecond. Strictly increasing for
/// the lifetime of the process.
fn next_session_id() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let candidate = now.max(prev + 1);
        match LAST.compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

pub struct SessionStore {
    collection: SessionCollection,
    store: Box<dyn KeyValueStore>,
}

impl SessionStore {
    /// Construct the store, repopulating the collection from the last
    /// flushed state. A missing or unreadable blob starts empty rather
    /// than failing startup.
    pub async fn open(store: Box<dyn KeyValueStore>) -> Self {
        let collection = match store.get(SESSIONS_KEY).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(collection) => collection,
                Err(err) => {
                    warn!("discarding unreadable session collection: {err}");
                    SessionCollection::default()
                }
            },
            Ok(None) => SessionCollection::default(),
            Err(err) => {
                warn!("failed to load session collection: {err}");
                SessionCollection::default()
            }
        };

        let mut store = Self { collection, store };
        // A dangling active pointer can only come from a hand-edited file;
        // clear it instead of trusting it.
        if let Some(active) = store.collection.active {
            if store.find(active).is_none() {
                store.collection.active = None;
            }
        }
        store
    }

    pub fn sessions(&self) -> &[Session] {
        &self.collection.sessions
    }

    pub fn active_id(&self) -> Option<u64> {
        self.collection.active
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.collection.active.and_then(|id| self.find(id))
    }

    /// Messages of the active session; empty when nothing is active.
    pub fn messages(&self) -> &[Message] {
        self.active_session()
            .map(|session| session.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn find(&self, id: u64) -> Option<&Session> {
        self.collection.sessions.iter().find(|s| s.id == id)
    }

    fn find_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.collection.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Insert a new empty session at the front and make it active.
    pub async fn create_session(&mut self) -> u64 {
        let session = Session::new();
        let id = session.id;
        self.collection.sessions.insert(0, session);
        self.collection.active = Some(id);
        self.persist().await;
        id
    }

    /// Silent no-op when `id` is not in the collection. The active pointer
    /// rides along with the collection blob, so no dedicated flush happens
    /// here; the next mutation persists it.
    pub fn switch_to(&mut self, id: u64) {
        if self.find(id).is_some() {
            self.collection.active = Some(id);
        }
    }

    pub async fn append_message(
        &mut self,
        session_id: u64,
        message: Message,
    ) -> Result<(), StoreError> {
        let session = self
            .find_mut(session_id)
            .ok_or(StoreError::SessionNotFound { id: session_id })?;
        session.updated_at = Utc::now();
        session.messages.push(message);
        self.persist().await;
        Ok(())
    }

    /// Overwrite the streaming assistant message at the tail of a session.
    /// The rendered content replaces the previous one wholesale; a final
    /// timestamp, when present, replaces the message's own.
    pub async fn rewrite_tail(
        &mut self,
        session_id: u64,
        content: String,
        reasoning: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let session = self
            .find_mut(session_id)
            .ok_or(StoreError::SessionNotFound { id: session_id })?;
        let tail = match session.messages.last_mut() {
            Some(message) if message.is_assistant() => message,
            _ => return Err(StoreError::NoAssistantTail { id: session_id }),
        };

        tail.content = content;
        tail.reasoning = reasoning;
        if let Some(ts) = timestamp {
            tail.timestamp = ts;
        }
        session.updated_at = timestamp.map_or_else(Utc::now, |ts| ts.max(Utc::now()));
        self.persist().await;
        Ok(())
    }

    /// Remove a session. Deleting the active session clears the active
    /// pointer, leaving no session presented.
    pub async fn delete_session(&mut self, id: u64) -> Result<(), StoreError> {
        let before = self.collection.sessions.len();
        self.collection.sessions.retain(|s| s.id != id);
        if self.collection.sessions.len() == before {
            return Err(StoreError::SessionNotFound { id });
        }
        if self.collection.active == Some(id) {
            self.collection.active = None;
        }
        self.persist().await;
        Ok(())
    }

    async fn persist(&self) {
        let value = match serde_json::to_value(&self.collection) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to serialize session collection: {err}");
                return;
            }
        };
        if let Err(err) = self.store.set(SESSIONS_KEY, value).await {
            warn!("failed to persist session collection: {err}");
        }
    }
}

/// Derive a session's display title from its first user message.
pub fn title_for(session: &Session) -> String {
    let first_user = session
        .messages
        .iter()
        .find(|message| message.role == Role::User);

    match first_user {
        Some(message) => {
            let content = message.content.trim();
            if content.chars().count() > TITLE_KEEP_CHARS {
                let kept: String = content.chars().take(TITLE_KEEP_CHARS).collect();
                format!("{kept}...")
            } else {
                content.to_string()
            }
        }
        None => UNTITLED_SESSION.to_string(),
    }
}

/// Human-relative age label for a timestamp.
pub fn relative_age(timestamp: DateTime<Utc>) -> String {
    relative_age_at(timestamp, Utc::now())
}

fn relative_age_at(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(timestamp);
    let minutes = elapsed.num_minutes();
    if minutes < 1 {
        "Just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if elapsed.num_hours() < 24 {
        format!("{}h ago", elapsed.num_hours())
    } else if elapsed.num_days() < 7 {
        format!("{}d ago", elapsed.num_days())
    } else {
        timestamp.format("%b %-d, %Y").to_string()
    }
}
