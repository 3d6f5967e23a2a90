//! Chatbot module - relays Telegram messages to Gemini with per-user history.

pub mod conversation;
pub mod event;
pub mod gemini;
pub mod handler;
pub mod message;
pub mod telegram;


pub use conversation::{ConversationStore, InMemoryStore, Session};
pub use event::{EventKind, InboundEvent, Reply, ReplyMarkup};
pub use gemini::{AiClient, AiError, GeminiClient};
pub use handler::{HandlerError, MessageHandler, Replier};
pub use message::{Role, Turn};
pub use telegram::TelegramClient;
