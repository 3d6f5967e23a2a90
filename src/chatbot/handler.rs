//! Message handler: one inbound event in, one reply out.
//!
//! Text messages run append → snapshot → AI call → append → reply while
//! holding that user's lock, so two messages from the same user never
//! interleave. Different users never wait on each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::chatbot::conversation::ConversationStore;
use crate::chatbot::event::{
    CALLBACK_CLEAR, CALLBACK_HELP, EventKind, InboundEvent, Reply, ReplyMarkup,
};
use crate::chatbot::gemini::AiClient;
use crate::chatbot::message::Turn;

pub const WELCOME_MESSAGE: &str =
    "Welcome to the Gemini AI Bot! Send me any message, and I'll reply using Gemini AI.";
pub const HELP_MESSAGE: &str = "I am a bot powered by Gemini AI. You can ask me any question or have a conversation with me!\n\n\
/start - show the welcome message\n\
/help - show this help\n\
/clear - forget our conversation so far";
pub const CLEARED_MESSAGE: &str = "Conversation history cleared.";
pub const NOTHING_TO_CLEAR_MESSAGE: &str = "There is no conversation history to clear.";
pub const UNEXPECTED_ERROR_MESSAGE: &str = "An unexpected error occurred. Please try again later.";

/// Outbound side of the messaging platform.
#[async_trait]
pub trait Replier: Send + Sync {
    async fn send(&self, reply: Reply) -> Result<(), String>;
}

/// Failure while handling a single event.
#[derive(Debug)]
pub enum HandlerError {
    /// The reply could not be delivered.
    Send(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Send(e) => write!(f, "failed to send reply: {e}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Per-user async locks. Entries are dropped once nobody holds or waits on them.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    async fn lock(&self, user_id: i64) -> UserGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().expect("user locks poisoned");
            locks.entry(user_id).or_default().clone()
        };
        UserGuard {
            locks: self,
            user_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release(&self, user_id: i64) {
        let mut locks = self.locks.lock().expect("user locks poisoned");
        // Only the map's own reference left: no holder, no waiter.
        if locks.get(&user_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&user_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().expect("user locks poisoned").len()
    }
}

struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(self.user_id);
    }
}

pub struct MessageHandler {
    store: Arc<dyn ConversationStore>,
    ai: Arc<dyn AiClient>,
    replier: Arc<dyn Replier>,
    locks: UserLocks,
}

impl MessageHandler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        ai: Arc<dyn AiClient>,
        replier: Arc<dyn Replier>,
    ) -> Self {
        Self {
            store,
            ai,
            replier,
            locks: UserLocks::default(),
        }
    }

    /// Handle one event, turning any failure into a generic reply.
    ///
    /// Dispatch runs in its own task so a panic is contained to this event.
    pub async fn handle(self: &Arc<Self>, event: InboundEvent) {
        let this = Arc::clone(self);
        let task_event = event.clone();
        let outcome = tokio::spawn(async move { this.dispatch(&task_event).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(join_err) => format!("handler task failed: {join_err}"),
        };

        error!("Exception while handling an update from user {}: {}", event.user_id, failure);
        if let Err(e) = self
            .replier
            .send(Reply::text(&event, UNEXPECTED_ERROR_MESSAGE))
            .await
        {
            warn!("Failed to send error reply to user {}: {}", event.user_id, e);
        }
    }

    /// Route an event to its operation.
    pub async fn dispatch(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        match &event.kind {
            EventKind::Text(text) => self.on_text_message(event, text).await,
            EventKind::Start => self.on_start_command(event).await,
            EventKind::Help => self.on_help_command(event).await,
            EventKind::Clear => self.on_clear_command(event).await,
            EventKind::Callback(data) => match data.as_str() {
                CALLBACK_CLEAR => self.on_clear_command(event).await,
                CALLBACK_HELP => self.on_help_command(event).await,
                other => {
                    debug!("Ignoring unknown callback data {:?} from user {}", other, event.user_id);
                    Ok(())
                }
            },
        }
    }

    pub async fn on_text_message(&self, event: &InboundEvent, text: &str) -> Result<(), HandlerError> {
        let user_id = event.user_id;
        let _guard = self.locks.lock(user_id).await;

        let preview: String = text.chars().take(100).collect();
        info!("📨 Message from user {}: \"{}\"", user_id, preview);

        self.store.append(user_id, Turn::user(text));
        let turns = self.store.snapshot(user_id);

        let reply_text = match self.ai.complete(&turns).await {
            Ok(turn) => {
                info!(
                    "🤖 Reply for user {} ({} chars, {} turn(s) of context)",
                    user_id,
                    turn.content().chars().count(),
                    turns.len()
                );
                let text = turn.content().to_string();
                self.store.append(user_id, turn);
                text
            }
            Err(e) => {
                error!("AI call failed for user {}: {}", user_id, e);
                e.fallback_message().to_string()
            }
        };

        self.send(Reply::text(event, reply_text)).await
    }

    pub async fn on_clear_command(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        let _guard = self.locks.lock(event.user_id).await;

        let existed = self.store.clear(event.user_id);
        info!("🧹 Clear for user {} (had history: {})", event.user_id, existed);

        let text = if existed {
            CLEARED_MESSAGE
        } else {
            NOTHING_TO_CLEAR_MESSAGE
        };
        self.send(Reply::text(event, text)).await
    }

    pub async fn on_start_command(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        info!("User {} started the bot", event.user_id);
        self.send(Reply::text(event, WELCOME_MESSAGE).with_markup(ReplyMarkup::MainMenu))
            .await
    }

    pub async fn on_help_command(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        self.send(Reply::text(event, HELP_MESSAGE).with_markup(ReplyMarkup::MainMenu))
            .await
    }

    async fn send(&self, reply: Reply) -> Result<(), HandlerError> {
        self.replier.send(reply).await.map_err(HandlerError::Send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_locks_are_pruned_after_release() {
        let locks = UserLocks::default();
        {
            let _a = locks.lock(1).await;
            let _b = locks.lock(2).await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_user_lock_excludes_same_user() {
        let locks = Arc::new(UserLocks::default());
        let guard = locks.lock(1).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock(1).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Another user is not blocked.
        let _other = locks.lock(2).await;

        drop(guard);
        waiter.await.unwrap();
    }
}
