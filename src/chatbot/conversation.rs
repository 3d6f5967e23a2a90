//! Per-user conversation history kept in process memory.
//!
//! Nothing here survives a restart. Each session is bounded to a fixed
//! number of turns so long-running chats don't grow memory or request size
//! without limit.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::chatbot::message::{Role, Turn};

/// Default number of turns retained per user.
pub const DEFAULT_MAX_TURNS: usize = 20;

/// Ordered turn history for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    turns: Vec<Turn>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Drop the oldest turns until at most `max_turns` remain and the
    /// window starts with a user turn. Returns how many were dropped.
    fn trim_to(&mut self, max_turns: usize) -> usize {
        let mut drop = self.turns.len().saturating_sub(max_turns);
        if drop == 0 {
            return 0;
        }
        while drop < self.turns.len().saturating_sub(1)
            && self.turns[drop].role() == Role::Assistant
        {
            drop += 1;
        }
        if drop > 0 {
            self.turns.drain(..drop);
        }
        drop
    }
}

/// Storage for conversation sessions.
///
/// Implementations must make each call atomic with respect to other calls on
/// the same user. Multi-call sequences are serialized by the caller.
pub trait ConversationStore: Send + Sync {
    /// Existing session for the user, or a new empty one.
    fn get_or_create(&self, user_id: i64) -> Session;

    /// Append a turn to the end of the user's session, creating it if absent.
    fn append(&self, user_id: i64, turn: Turn);

    /// Remove the user's session. Returns whether one existed.
    fn clear(&self, user_id: i64) -> bool;

    /// Current turns for the user, oldest first. Empty for unknown users.
    fn snapshot(&self, user_id: i64) -> Vec<Turn>;
}

/// Process-local store backed by a locked map.
pub struct InMemoryStore {
    sessions: Mutex<HashMap<i64, Session>>,
    max_turns: usize,
}

impl InMemoryStore {
    /// Create an empty store keeping at most `max_turns` turns per user.
    ///
    /// A limit below 2 would make it impossible to keep a full exchange, so
    /// it is raised to 2.
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_turns: max_turns.max(2),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a session exists for the user.
    pub fn contains(&self, user_id: i64) -> bool {
        self.sessions().contains_key(&user_id)
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Session>> {
        self.sessions.lock().expect("sessions lock poisoned")
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}

impl ConversationStore for InMemoryStore {
    fn get_or_create(&self, user_id: i64) -> Session {
        self.sessions().entry(user_id).or_default().clone()
    }

    fn append(&self, user_id: i64, turn: Turn) {
        let mut sessions = self.sessions();
        let session = sessions.entry(user_id).or_default();
        session.push(turn);
        let dropped = session.trim_to(self.max_turns);
        if dropped > 0 {
            debug!("Trimmed {} old turn(s) for user {}", dropped, user_id);
        }
    }

    fn clear(&self, user_id: i64) -> bool {
        self.sessions().remove(&user_id).is_some()
    }

    fn snapshot(&self, user_id: i64) -> Vec<Turn> {
        self.sessions()
            .get(&user_id)
            .map(|s| s.turns().to_vec())
            .unwrap_or_default()
    }
}
