//! Telegram front end for Gemini chat with per-user conversation history.

pub mod chatbot;
pub mod config;
pub mod telegram_log;
