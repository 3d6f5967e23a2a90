//! Telegram side of the bot: outbound replies and update conversion.

use std::future::Future;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::utils::command::BotCommands;
use tracing::{debug, warn};

use crate::chatbot::event::{CALLBACK_CLEAR, CALLBACK_HELP, EventKind, Reply, ReplyMarkup};
use crate::chatbot::handler::Replier;

/// Telegram rejects messages longer than this many characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Commands the bot understands.
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "show the welcome message")]
    Start,
    #[command(description = "show help")]
    Help,
    #[command(description = "forget our conversation so far")]
    Clear,
}

impl From<Command> for EventKind {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Start => EventKind::Start,
            Command::Help => EventKind::Help,
            Command::Clear => EventKind::Clear,
        }
    }
}

/// Classify message text. `None` means an unknown command, which is ignored.
///
/// With an empty `bot_username` (lookup failed at startup) a `@name` suffix
/// is accepted for any name.
pub fn classify_text(text: &str, bot_username: &str) -> Option<EventKind> {
    if !text.starts_with('/') {
        return Some(EventKind::Text(text.to_string()));
    }
    let parsed = match Command::parse(text, bot_username) {
        Err(_) if bot_username.is_empty() => Command::parse(&strip_addressee(text), ""),
        other => other,
    };
    match parsed {
        Ok(cmd) => Some(cmd.into()),
        Err(e) => {
            debug!("Not a known command {:?}: {}", text, e);
            None
        }
    }
}

/// `/cmd@name args` -> `/cmd args`.
fn strip_addressee(text: &str) -> String {
    let (head, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
    let bare = head.split('@').next().unwrap_or(head);
    if rest.is_empty() {
        bare.to_string()
    } else {
        format!("{bare} {rest}")
    }
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Show "typing..." in the chat. Best effort.
    pub async fn send_typing(&self, chat_id: i64) {
        if let Err(e) = self
            .bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
        {
            warn!("Failed to send typing action: {e}");
        }
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<ReplyMarkup>,
    ) -> Result<(), String> {
        let chunks = plan_chunks(text, MAX_MESSAGE_CHARS, markup);
        deliver_chunks(chunks, |chunk, markup| {
            let mut request = self.bot.send_message(ChatId(chat_id), chunk);
            if let Some(markup) = markup {
                request = request.reply_markup(render_markup(markup));
            }
            async move { request.await.map(|_| ()).map_err(|e| e.to_string()) }
        })
        .await
    }
}

/// Split `text` for sending. Only the last chunk carries `markup`.
fn plan_chunks(
    text: &str,
    max_chars: usize,
    markup: Option<ReplyMarkup>,
) -> Vec<(String, Option<ReplyMarkup>)> {
    let chunks = split_message(text, max_chars);
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| (chunk, if i == last { markup } else { None }))
        .collect()
}

/// Send chunks in order, stopping at the first failure.
///
/// Only a failed first chunk is an error. Once part of the reply is in the
/// chat, a later failure is logged and the reply counts as delivered.
async fn deliver_chunks<F, Fut>(
    chunks: Vec<(String, Option<ReplyMarkup>)>,
    mut send: F,
) -> Result<(), String>
where
    F: FnMut(String, Option<ReplyMarkup>) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let total = chunks.len();
    for (i, (chunk, markup)) in chunks.into_iter().enumerate() {
        if let Err(e) = send(chunk, markup).await {
            if i == 0 {
                let msg = format!("Failed to send: {e}");
                warn!("{}", msg);
                return Err(msg);
            }
            warn!("Reply cut short: chunk {} of {} failed: {}", i + 1, total, e);
            return Ok(());
        }
    }
    Ok(())
}

#[async_trait]
impl Replier for TelegramClient {
    async fn send(&self, reply: Reply) -> Result<(), String> {
        self.send_message(reply.chat_id, &reply.text, reply.markup)
            .await
    }
}

fn render_markup(markup: ReplyMarkup) -> InlineKeyboardMarkup {
    match markup {
        ReplyMarkup::MainMenu => InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback("Clear history", CALLBACK_CLEAR),
            InlineKeyboardButton::callback("Help", CALLBACK_HELP),
        ]]),
    }
}

/// Split text into chunks of at most `max_chars` characters.
///
/// Prefers breaking after a newline in the second half of a chunk. Always
/// returns at least one chunk.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + max_chars).min(chars.len());
        if end < chars.len()
            && let Some(pos) = chars[start + max_chars / 2..end]
                .iter()
                .rposition(|&c| c == '\n')
        {
            end = start + max_chars / 2 + pos + 1;
        }
        chunks.push(chars[start..end].iter().collect());
        start = end;
    }
    chunks
}
