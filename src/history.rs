//! Conversation History and sessions
//!
//! Each session owns an append-only list of turns. The history sits behind
//! an async mutex that the chat service holds for a whole turn, so turns of
//! one session are serialized while different sessions run independently.

use crate::config::SessionConfig;
use crate::llm::ChatMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_user(&mut self, content: impl Into<String>) {
        self.push(TurnRole::User, content.into());
    }

    pub fn append_assistant(&mut self, content: impl Into<String>) {
        self.push(TurnRole::Assistant, content.into());
    }

    fn push(&mut self, role: TurnRole, content: String) {
        self.turns.push(ConversationTurn {
            role,
            content,
            created_at: Utc::now(),
        });
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Turns in prompt form, oldest first.
    pub fn as_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| match turn.role {
                TurnRole::User => ChatMessage::user(turn.content.clone()),
                TurnRole::Assistant => ChatMessage::assistant(turn.content.clone()),
            })
            .collect()
    }
}

pub type SharedHistory = Arc<tokio::sync::Mutex<ConversationHistory>>;

struct SessionEntry {
    history: SharedHistory,
    last_access: Instant,
}

impl SessionEntry {
    /// A turn holds or waits for this history.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.history) > 1
    }
}

/// In-memory session registry with idle expiry and LRU eviction.
/// Sessions with a turn in flight are never expired or evicted.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: config.ttl(),
            max_sessions: config.max_sessions.max(1),
        }
    }

    /// Look up a session, or start a new one when `id` is absent or unknown.
    pub fn get_or_create(&self, id: Option<&str>) -> (String, SharedHistory) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        self.purge_expired(&mut sessions, now);

        if let Some(id) = id {
            if let Some(entry) = sessions.get_mut(id) {
                entry.last_access = now;
                return (id.to_string(), entry.history.clone());
            }
        }

        if sessions.len() >= self.max_sessions {
            let oldest = sessions
                .iter()
                .filter(|(_, entry)| !entry.in_use())
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => {
                    sessions.remove(&oldest);
                    info!("Evicted least recently used session {}", oldest);
                }
                None => warn!("All {} sessions are busy, going over the limit", sessions.len()),
            }
        }

        let id = Uuid::new_v4().to_string();
        let history = SharedHistory::default();
        sessions.insert(
            id.clone(),
            SessionEntry {
                history: history.clone(),
                last_access: now,
            },
        );
        debug!("Created session {}", id);
        (id, history)
    }

    /// An existing, unexpired session.
    pub fn get(&self, id: &str) -> Option<SharedHistory> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        self.purge_expired(&mut sessions, now);
        sessions.get_mut(id).map(|entry| {
            entry.last_access = now;
            entry.history.clone()
        })
    }

    /// Restart the idle clock of a session, e.g. when a turn commits.
    pub fn touch(&self, id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = sessions.get_mut(id) {
            entry.last_access = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(&self, sessions: &mut HashMap<String, SessionEntry>, now: Instant) {
        let before = sessions.len();
        sessions.retain(|_, entry| {
            entry.in_use() || now.saturating_duration_since(entry.last_access) <= self.ttl
        });
        let expired = before - sessions.len();
        if expired > 0 {
            debug!("Expired {} idle sessions", expired);
        }
    }
}
