//! Platform-independent inbound events and outbound replies.

/// What kind of inbound event the platform delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Plain text to forward to the AI.
    Text(String),
    Start,
    Clear,
    Help,
    /// Inline button press, carrying the button's callback data.
    Callback(String),
}

/// One inbound event for the message handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Stable platform user id; sessions are keyed by it.
    pub user_id: i64,
    /// Chat the reply goes to (equal to `user_id` in private chats).
    pub chat_id: i64,
    pub kind: EventKind,
}

impl InboundEvent {
    pub fn new(user_id: i64, chat_id: i64, kind: EventKind) -> Self {
        Self {
            user_id,
            chat_id,
            kind,
        }
    }

    /// Event from a private chat, where chat and user ids coincide.
    pub fn private(user_id: i64, kind: EventKind) -> Self {
        Self::new(user_id, user_id, kind)
    }
}

/// UI chrome attached to a reply. Rendered by the platform adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMarkup {
    /// "Clear history" and "Help" buttons.
    MainMenu,
}

/// Callback data carried by the main-menu buttons.
pub const CALLBACK_CLEAR: &str = "clear";
pub const CALLBACK_HELP: &str = "help";

/// One outbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub user_id: i64,
    pub chat_id: i64,
    pub text: String,
    pub markup: Option<ReplyMarkup>,
}

impl Reply {
    pub fn text(event: &InboundEvent, text: impl Into<String>) -> Self {
        Self {
            user_id: event.user_id,
            chat_id: event.chat_id,
            text: text.into(),
            markup: None,
        }
    }

    pub fn with_markup(mut self, markup: ReplyMarkup) -> Self {
        self.markup = Some(markup);
        self
    }
}
